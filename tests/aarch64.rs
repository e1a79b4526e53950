use jit_codebuf::isa::TargetIsa;
use jit_codebuf::isa::aarch64::{Aarch64, Aarch64Features, Cond};
use jit_codebuf::settings::{self, Flags};
use jit_codebuf::{Assembler, CodeMetadata};

fn assembler() -> Assembler<Aarch64> {
    let _ = env_logger::try_init();
    Assembler::new(Aarch64::new(Aarch64Features::empty()), &Flags::new(settings::builder()))
}

fn words(code: &[u8]) -> Vec<u32> {
    code.chunks_exact(4)
        .map(|w| u32::from_le_bytes(w.try_into().unwrap()))
        .collect()
}

#[test]
fn replay_with_label_at_snippet_end() {
    let mut asm = assembler();
    let mut meta = CodeMetadata::new();
    let top = asm.get_label();
    let done = asm.get_label();
    let tail = asm.get_label();
    asm.bind_label(top);
    asm.nop();

    asm.start_snippet(&meta);
    asm.cbz(0, done); // 4
    asm.b(top); // 8
    asm.b_cond(Cond::Eq, tail); // 12
    asm.bind_label(tail); // 16, the end of the snippet
    let snippet = asm.stop_snippet(&meta);
    assert_eq!(snippet.code_range(), Some(4..16));
    assert_eq!(snippet.patches().count(), 3);

    asm.replay_snippet(&snippet, &mut meta); // 16..28
    asm.bind_label(done);
    asm.ret();

    let code = asm.close(true, 0).unwrap();
    assert_eq!(
        words(&code),
        vec![
            0xd503_201f, // nop
            0xb400_00c0, // cbz x0, 28
            0x17ff_fffe, // b 0
            0x5400_0020, // b.eq 16
            0xb400_0060, // cbz x0, 28
            0x17ff_fffb, // b 0
            0x54ff_ffc0, // b.eq 16
            0xd65f_03c0, // ret
        ]
    );
}

#[test]
fn close_pads_with_nops() {
    let mut asm = assembler();
    asm.ret();
    let code = asm.finish().unwrap();
    assert_eq!(code.len(), 16);
    assert_eq!(words(&code[4..]), vec![0xd503_201f; 3]);
    assert_eq!(asm.final_code_size(), 16);
    assert_eq!(asm.isa().name(), "aarch64");
}

#[test]
fn feature_scopes_over_host_baseline() {
    let isa = Aarch64::host();
    let baseline = isa.baseline_features();
    let mut asm = Assembler::new(isa, &Flags::default());
    asm.push_features(Aarch64Features::LSE | Aarch64Features::FP16);
    assert!(asm.has_feature(Aarch64Features::LSE));
    asm.push_features(Aarch64Features::LSE);
    assert!(!asm.features().is_active_in_innermost_scope(Aarch64Features::LSE));
    asm.pop_features();
    asm.pop_features();
    assert_eq!(asm.features().active(), baseline);
}

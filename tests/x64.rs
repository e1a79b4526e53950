use jit_codebuf::isa::x64::{Cond, X64, X64Features};
use jit_codebuf::settings::{self, Flags};
use jit_codebuf::{Assembler, CodeMetadata, CodegenError, TrapCode};
use proptest::prelude::*;

fn assembler() -> Assembler<X64> {
    let _ = env_logger::try_init();
    Assembler::new(X64::new(X64Features::empty()), &Flags::new(settings::builder()))
}

/// Decode the target of the `jmp rel32` at `at`.
fn jmp_target(code: &[u8], at: usize) -> i64 {
    assert_eq!(code[at], 0xe9);
    let disp = i32::from_le_bytes(code[at + 1..at + 5].try_into().unwrap());
    (at + 5) as i64 + i64::from(disp)
}

#[test]
fn replayed_guard() {
    let mut asm = assembler();
    let mut meta = CodeMetadata::new();
    let entry = asm.get_label();
    let exit = asm.get_label();
    asm.bind_label(entry);
    asm.nop();

    asm.start_snippet(&meta);
    let skip = asm.get_label();
    asm.jcc_short(Cond::E, skip); // 1..3
    meta.add_trap(asm.cur_offset(), TrapCode::UnreachableCodeReached);
    asm.ud2(); // 3..5
    asm.bind_label(skip);
    asm.jcc(Cond::NE, entry); // 5..11
    asm.jmp(exit); // 11..16
    let guard = asm.stop_snippet(&meta);

    asm.replay_snippet(&guard, &mut meta); // 16..31
    asm.bind_label(exit);
    asm.ret();

    let code = asm.close(true, 0).unwrap();
    assert_eq!(
        code,
        vec![
            0x90, //
            0x74, 0x02, // je +2
            0x0f, 0x0b, // ud2
            0x0f, 0x85, 0xf5, 0xff, 0xff, 0xff, // jne 0
            0xe9, 0x0f, 0x00, 0x00, 0x00, // jmp 31
            0x74, 0x02, // je +2
            0x0f, 0x0b, // ud2
            0x0f, 0x85, 0xe6, 0xff, 0xff, 0xff, // jne 0
            0xe9, 0x00, 0x00, 0x00, 0x00, // jmp 31
            0xc3,
        ]
    );
    assert_eq!(
        meta.traps().collect::<Vec<_>>(),
        vec![
            (3, TrapCode::UnreachableCodeReached),
            (18, TrapCode::UnreachableCodeReached),
        ]
    );
}

#[test]
fn unresolved_after_replay_lists_every_copy() {
    let mut asm = assembler();
    let mut meta = CodeMetadata::new();
    let missing = asm.get_label();
    asm.start_snippet(&meta);
    asm.jmp(missing);
    let snippet = asm.stop_snippet(&meta);
    asm.replay_snippet(&snippet, &mut meta);
    asm.replay_snippet(&snippet, &mut meta);

    let err = asm.close(true, 0).unwrap_err();
    assert_eq!(
        err.to_string(),
        "unresolved labels at close: label0 referenced at 0x0, 0x5, 0xa"
    );
    assert!(matches!(err, CodegenError::UnresolvedLabels(_)));
}

proptest! {
    #[test]
    fn every_copy_reaches_the_outer_label(gaps in prop::collection::vec(0usize..300, 1..8)) {
        let mut asm = assembler();
        let mut meta = CodeMetadata::new();
        let back = asm.get_label();
        let fwd = asm.get_label();
        asm.bind_label(back);
        asm.ret();

        asm.start_snippet(&meta);
        asm.jmp(back);
        asm.jmp(fwd);
        let snippet = asm.stop_snippet(&meta);

        let mut sites = vec![1usize];
        for gap in gaps {
            for _ in 0..gap {
                asm.nop();
            }
            sites.push(asm.cur_offset() as usize);
            asm.replay_snippet(&snippet, &mut meta);
        }
        let fwd_offset = asm.cur_offset();
        asm.bind_label(fwd);
        asm.ret();

        let code = asm.close(true, 0).unwrap();
        for site in sites {
            prop_assert_eq!(jmp_target(&code, site), 0);
            prop_assert_eq!(jmp_target(&code, site + 5), i64::from(fwd_offset));
        }
    }
}

//! Snippet replay against an ISA that records every patch request instead of
//! encoding it, so that the offsets and deltas can be checked directly.

use bitflags::bitflags;
use jit_codebuf::buffer::CodeBuffer;
use jit_codebuf::isa::TargetIsa;
use jit_codebuf::settings::{self, Flags};
use jit_codebuf::{Assembler, CodeMetadata, CodeOffset, Endianness, SnippetRecorder, TrapCode};
use std::cell::RefCell;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct NoFeatures: u8 {
        const DUMMY = 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Patch {
    Jump { branch: CodeOffset, target: CodeOffset },
    Relative { branch: CodeOffset, delta: i64 },
}

#[derive(Default)]
struct Recording {
    patches: RefCell<Vec<Patch>>,
}

impl Recording {
    fn take(&self) -> Vec<Patch> {
        self.patches.take()
    }
}

impl TargetIsa for Recording {
    type Features = NoFeatures;

    fn name(&self) -> &'static str {
        "recording"
    }

    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    fn nop(&self) -> &'static [u8] {
        &[0]
    }

    fn baseline_features(&self) -> NoFeatures {
        NoFeatures::empty()
    }

    fn patch_jump_target(&self, _buf: &mut CodeBuffer, branch: CodeOffset, target: CodeOffset) {
        self.patches.borrow_mut().push(Patch::Jump { branch, target });
    }

    fn patch_relative_jump_target(&self, _buf: &mut CodeBuffer, branch: CodeOffset, delta: i64) {
        self.patches.borrow_mut().push(Patch::Relative { branch, delta });
    }
}

fn assembler() -> Assembler<Recording> {
    let _ = env_logger::try_init();
    let mut b = settings::builder();
    b.set("unique_pc", "false").unwrap();
    Assembler::new(Recording::default(), &Flags::new(b))
}

fn fill_to(asm: &mut Assembler<Recording>, offset: CodeOffset) {
    while asm.cur_offset() < offset {
        asm.put1(0xaa);
    }
}

fn branch(asm: &mut Assembler<Recording>, size: CodeOffset, label: jit_codebuf::Label) {
    let start = asm.cur_offset();
    for _ in 0..size {
        asm.put1(0xbb);
    }
    asm.use_label(start, label);
}

#[test]
fn replay_fixes_up_outside_and_unbound_labels() {
    let mut asm = assembler();
    let mut meta = CodeMetadata::new();
    let inner = asm.get_label();
    let far = asm.get_label();
    let later = asm.get_label();

    fill_to(&mut asm, 100);
    asm.start_snippet(&meta);
    fill_to(&mut asm, 104);
    asm.bind_label(inner);
    fill_to(&mut asm, 106);
    meta.add_trap(106, TrapCode::IntegerDivisionByZero);
    fill_to(&mut asm, 108);
    branch(&mut asm, 4, inner); // 108..112
    branch(&mut asm, 2, far); // 112..114
    branch(&mut asm, 2, later); // 114..116
    let snippet = asm.stop_snippet(&meta);

    assert_eq!(snippet.code_range(), Some(100..116));
    assert_eq!(
        snippet.patches().collect::<Vec<_>>(),
        vec![(112, far), (114, later)]
    );
    assert_eq!(
        asm.isa().take(),
        vec![Patch::Jump {
            branch: 108,
            target: 104
        }]
    );

    fill_to(&mut asm, 200);
    asm.bind_label(far);
    fill_to(&mut asm, 500);
    asm.isa().take();

    asm.replay_snippet(&snippet, &mut meta);
    assert_eq!(asm.cur_offset(), 516);
    assert_eq!(&asm.buffer().data()[500..516], &asm.buffer().data()[100..116]);
    assert_eq!(
        asm.isa().take(),
        vec![Patch::Relative {
            branch: 512,
            delta: -400
        }]
    );
    assert_eq!(asm.labels().get(later).pending_patches(), &[114, 514]);
    assert_eq!(
        meta.traps().collect::<Vec<_>>(),
        vec![
            (106, TrapCode::IntegerDivisionByZero),
            (506, TrapCode::IntegerDivisionByZero),
        ]
    );

    fill_to(&mut asm, 600);
    asm.bind_label(later);
    assert_eq!(
        asm.isa().take(),
        vec![
            Patch::Jump {
                branch: 114,
                target: 600
            },
            Patch::Jump {
                branch: 514,
                target: 600
            },
        ]
    );
    assert_eq!(asm.close(true, 0).unwrap().len(), 600);
}

#[test]
fn label_bound_at_snippet_end_is_outside() {
    let mut asm = assembler();
    let meta = CodeMetadata::new();
    let end = asm.get_label();

    fill_to(&mut asm, 8);
    asm.start_snippet(&meta);
    branch(&mut asm, 4, end); // 8..12
    asm.bind_label(end);
    let snippet = asm.stop_snippet(&meta);
    assert_eq!(snippet.code_range(), Some(8..12));
    assert_eq!(snippet.patches().collect::<Vec<_>>(), vec![(8, end)]);
    asm.isa().take();

    fill_to(&mut asm, 20);
    let mut meta = meta;
    asm.replay_snippet(&snippet, &mut meta);
    assert_eq!(
        asm.isa().take(),
        vec![Patch::Relative {
            branch: 20,
            delta: -12
        }]
    );
}

#[test]
fn replay_inside_another_recording_is_mirrored() {
    let mut asm = assembler();
    let mut meta = CodeMetadata::new();
    let out = asm.get_label();
    let back = asm.get_label();
    asm.bind_label(back);

    fill_to(&mut asm, 4);
    asm.start_snippet(&meta);
    branch(&mut asm, 2, back); // 4..6
    branch(&mut asm, 2, out); // 6..8
    let first = asm.stop_snippet(&meta);

    asm.start_snippet(&meta);
    asm.replay_snippet(&first, &mut meta); // 8..12, shift 4
    let second = asm.stop_snippet(&meta);
    assert_eq!(second.code_range(), Some(8..12));
    assert_eq!(
        second.patches().collect::<Vec<_>>(),
        vec![(8, back), (10, out)]
    );

    asm.replay_snippet(&second, &mut meta);
    assert_eq!(asm.labels().get(out).pending_patches(), &[6, 10, 14]);
    asm.bind_label(out);
    asm.close(true, 0).unwrap();
}

#[test]
fn moved_label_use_stays_in_sync_with_replay() {
    let mut asm = assembler();
    let mut meta = CodeMetadata::new();
    let l = asm.get_label();

    fill_to(&mut asm, 100);
    asm.start_snippet(&meta);
    asm.put4(0); // 100..104
    asm.use_label(100, l);
    asm.update_label_use(l, 100, 2);
    assert_eq!(asm.labels().get(l).pending_patches(), &[102]);
    let snippet = asm.stop_snippet(&meta);
    assert_eq!(snippet.patches().collect::<Vec<_>>(), vec![(102, l)]);

    fill_to(&mut asm, 500);
    asm.replay_snippet(&snippet, &mut meta);
    assert_eq!(asm.labels().get(l).pending_patches(), &[102, 502]);

    asm.bind_label(l);
    assert_eq!(
        asm.isa().take(),
        vec![
            Patch::Jump {
                branch: 102,
                target: 504
            },
            Patch::Jump {
                branch: 502,
                target: 504
            },
        ]
    );
}

#[test]
fn moved_label_use_outside_recording() {
    let mut asm = assembler();
    let queued = asm.get_label();
    let bound = asm.get_label();
    asm.bind_label(bound);

    asm.put4(0);
    asm.use_label(0, queued);
    asm.update_label_use(queued, 0, 1);
    assert_eq!(asm.labels().get(queued).pending_patches(), &[1]);

    asm.put4(0);
    asm.use_label(4, bound);
    asm.isa().take();
    asm.update_label_use(bound, 4, 2);
    assert_eq!(
        asm.isa().take(),
        vec![Patch::Jump {
            branch: 6,
            target: 0
        }]
    );
}

#[test]
fn standalone_recorder_tracks_patches() {
    let mut asm = assembler();
    let meta = CodeMetadata::new();
    let l = asm.get_label();
    let mut rec = SnippetRecorder::new();
    rec.start(asm.buffer(), &meta);
    asm.put4(0);
    rec.add_patch(0, l);
    rec.update_patch(0, 1);
    rec.stop(asm.buffer(), asm.labels(), &meta);
    assert_eq!(rec.patches().collect::<Vec<_>>(), vec![(1, l)]);
}

#[test]
#[should_panic(expected = "snippet replayed before it was stopped")]
fn replay_before_stop() {
    let mut asm = assembler();
    let mut meta = CodeMetadata::new();
    let rec = SnippetRecorder::new();
    rec.replay(&mut asm, &mut meta);
}

#[test]
#[should_panic(expected = "nested snippet recording")]
fn nested_recording() {
    let mut asm = assembler();
    let meta = CodeMetadata::new();
    asm.start_snippet(&meta);
    asm.start_snippet(&meta);
}

#[test]
#[should_panic(expected = "cannot emit after close")]
fn replay_after_close() {
    let mut asm = assembler();
    let mut meta = CodeMetadata::new();
    asm.start_snippet(&meta);
    asm.put4(0);
    let snippet = asm.stop_snippet(&meta);
    asm.close(true, 0).unwrap();
    asm.replay_snippet(&snippet, &mut meta);
}

#[test]
#[should_panic(expected = "snippet still recording at close")]
fn close_while_recording() {
    let mut asm = assembler();
    let meta = CodeMetadata::new();
    asm.start_snippet(&meta);
    let _ = asm.close(true, 0);
}

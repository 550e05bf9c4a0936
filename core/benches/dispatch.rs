//! Benchmark: opcode decode throughput and VM dispatch-loop throughput.
//!
//! Run with: `cargo bench --bench dispatch`

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use hashbrown::HashMap;

use dnx_core::image::BinaryImage;
use dnx_core::opcode::{self, Opcode};
use dnx_core::{MapRegistry, Vm};

fn bench_decode(c: &mut Criterion) {
    let mut bytes = Vec::new();
    for i in 0..1000i32 {
        opcode::encode(Opcode::PushInt(i), &mut bytes);
    }
    opcode::encode(Opcode::Exit, &mut bytes);

    c.bench_function("decode_1000_push_int", |b| {
        b.iter(|| {
            let mut ip = 0usize;
            let mut count = 0u32;
            while ip < bytes.len() {
                let (op, next_ip) = opcode::decode(black_box(&bytes), ip).unwrap();
                if matches!(op, Opcode::Exit) {
                    break;
                }
                count += 1;
                ip = next_ip;
            }
            count
        })
    });
}

/// A scene that loops `Subtraction` a fixed number of times before exiting:
/// `local = local - 1; jump back while truthy`, the tightest loop the
/// dispatch loop can run without touching strings, arrays or the call stack.
fn counting_loop_image(iterations: i32) -> BinaryImage {
    let mut bytes = Vec::new();
    // local 0 = iterations (the loop counter)
    opcode::encode(Opcode::PushInt(iterations), &mut bytes);
    opcode::encode(Opcode::SetVarLocal(0), &mut bytes);

    let loop_start = bytes.len() as i32;
    opcode::encode(Opcode::PushVarLocal(0), &mut bytes);
    opcode::encode(Opcode::PushInt(1), &mut bytes);
    opcode::encode(Opcode::Subtraction, &mut bytes);
    opcode::encode(Opcode::SetVarLocal(0), &mut bytes);

    opcode::encode(Opcode::PushVarLocal(0), &mut bytes);
    // `JumpTruthy`'s operand is relative to the offset just past its own
    // operand (§4.1), not an absolute address — back-patch it accordingly.
    let jump_tag_ip = bytes.len() as i32;
    let jump_next_ip = jump_tag_ip + 5; // 1 tag byte + 4 operand bytes
    opcode::encode(Opcode::JumpTruthy(loop_start - jump_next_ip), &mut bytes);

    opcode::encode(Opcode::PushInt(0), &mut bytes);
    opcode::encode(Opcode::Exit, &mut bytes);

    let mut scenes = HashMap::new();
    scenes.insert(0u32, vec![0]);

    BinaryImage {
        string_table: vec!["main".to_string()],
        translation_table: Vec::new(),
        translation_loaded: true,
        instructions: bytes,
        scenes,
        functions: HashMap::new(),
        definitions: HashMap::new(),
        external_functions: Vec::new(),
    }
}

fn bench_vm_loop(c: &mut Criterion) {
    c.bench_function("vm_counting_loop_1000", |b| {
        b.iter(|| {
            let image = counting_loop_image(black_box(1000));
            let mut vm = Vm::new(image, Box::new(MapRegistry::new()));
            vm.run_scene("main").unwrap();
            while !vm.paused() {
                vm.update().unwrap();
            }
        })
    });
}

criterion_group!(benches, bench_decode, bench_vm_loop);
criterion_main!(benches);

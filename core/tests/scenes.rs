//! Whole-VM scenario tests, run through the public API only (as an external
//! host would), complementing the in-module unit tests in `vm::runtime`.

use hashbrown::HashMap;
use pretty_assertions::assert_eq;

use dnx_core::host::MapRegistry;
use dnx_core::image::BinaryImage;
use dnx_core::opcode::{self, Opcode};
use dnx_core::Vm;

fn image_with_scene(name: &str, instructions: Vec<u8>) -> BinaryImage {
    let mut scenes = HashMap::new();
    scenes.insert(0u32, vec![0]);
    BinaryImage {
        string_table: vec![name.to_string()],
        translation_table: Vec::new(),
        translation_loaded: true,
        instructions,
        scenes,
        functions: HashMap::new(),
        definitions: HashMap::new(),
        external_functions: Vec::new(),
    }
}

fn run_until_paused(vm: &mut Vm) {
    while !vm.paused() {
        vm.update().unwrap();
    }
}

/// A tiny branching scene: greet the player, offer a choice, and land in a
/// different spot in the instruction stream depending on the pick. This
/// walks the whole suspend/resume contract a console host follows (§6):
/// `run_scene` → drain text via `update`/`resume` → answer a choice →
/// drain more text → `scene_completed`.
#[test]
fn a_full_scene_with_text_and_a_branching_choice() {
    let mut bytes = Vec::new();
    opcode::encode(Opcode::PushBinaryString(1), &mut bytes); // "Welcome, traveler."
    opcode::encode(Opcode::TextRun, &mut bytes);

    opcode::encode(Opcode::ChoiceBegin, &mut bytes);
    opcode::encode(Opcode::PushBinaryString(2), &mut bytes); // "Go north"
    opcode::encode(Opcode::PushDouble(1.0), &mut bytes);
    opcode::encode(Opcode::ChoiceAdd(999), &mut bytes); // patched below
    opcode::encode(Opcode::PushBinaryString(3), &mut bytes); // "Go south"
    opcode::encode(Opcode::PushDouble(1.0), &mut bytes);
    opcode::encode(Opcode::ChoiceAdd(999), &mut bytes); // patched below
    opcode::encode(Opcode::ChoiceSelect, &mut bytes);

    let north_target = bytes.len() as i32;
    opcode::encode(Opcode::PushBinaryString(4), &mut bytes); // "A cold wind blows."
    opcode::encode(Opcode::TextRun, &mut bytes);
    opcode::encode(Opcode::Exit, &mut bytes);

    let south_target = bytes.len() as i32;
    opcode::encode(Opcode::PushBinaryString(5), &mut bytes); // "Warm sand underfoot."
    opcode::encode(Opcode::TextRun, &mut bytes);
    opcode::encode(Opcode::Exit, &mut bytes);

    // Patch the two placeholder ChoiceAdd operands now that both branch
    // offsets are known (mirrors how a real compiler back-patches jumps).
    patch_choice_add_target(&mut bytes, 0, north_target);
    patch_choice_add_target(&mut bytes, 1, south_target);

    let mut image = image_with_scene("main", bytes);
    image.string_table.push("Welcome, traveler.".to_string());
    image.string_table.push("Go north".to_string());
    image.string_table.push("Go south".to_string());
    image.string_table.push("A cold wind blows.".to_string());
    image.string_table.push("Warm sand underfoot.".to_string());

    let mut vm = Vm::new(image, Box::new(MapRegistry::new()));
    vm.run_scene("main").unwrap();
    run_until_paused(&mut vm);

    assert!(vm.running_text());
    assert_eq!(vm.current_text(), "Welcome, traveler.");
    vm.resume();
    run_until_paused(&mut vm);

    assert!(vm.select_choice());
    let choices = vm.choices();
    assert_eq!(choices.len(), 2);
    assert_eq!(choices[0].text, "Go north");
    assert_eq!(choices[1].text, "Go south");

    vm.choose_choice(1).unwrap();
    run_until_paused(&mut vm);

    assert!(vm.running_text());
    assert_eq!(vm.current_text(), "Warm sand underfoot.");
    vm.resume();
    run_until_paused(&mut vm);

    assert!(vm.scene_completed());
}

/// `ChoiceAdd`'s operand is the `nth` occurrence of `opcode::TAG_CHOICE_ADD`
/// in the encoded stream; finds it by scanning rather than hardcoding byte
/// offsets, so this test stays correct if the encoding of earlier
/// instructions changes.
fn patch_choice_add_target(bytes: &mut [u8], nth: usize, target: i32) {
    let mut seen = 0usize;
    let mut ip = 0usize;
    while ip < bytes.len() {
        let tag = bytes[ip];
        if tag == opcode::TAG_CHOICE_ADD {
            if seen == nth {
                bytes[ip + 1..ip + 5].copy_from_slice(&target.to_le_bytes());
                return;
            }
            seen += 1;
        }
        let (_, next_ip) = opcode::decode(bytes, ip).unwrap();
        ip = next_ip;
    }
    panic!("fewer than {} ChoiceAdd instructions in stream", nth + 1);
}

/// Flags persist across a scene restart (§4.3: flag preamble is first-write
/// wins into a *persistent* store) while locals/globals do not survive a
/// fresh `run_scene` call with a brand new image.
#[test]
fn flags_persist_across_a_second_run_scene_call() {
    let mut bytes = Vec::new();

    let value_ip = bytes.len() as i32;
    opcode::encode(Opcode::PushInt(0), &mut bytes); // flag default: 0
    opcode::encode(Opcode::Exit, &mut bytes);

    let name_ip = bytes.len() as i32;
    opcode::encode(Opcode::PushBinaryString(1), &mut bytes); // "unlocked"
    opcode::encode(Opcode::Exit, &mut bytes);

    let entry_ip = bytes.len() as i32;
    opcode::encode(Opcode::PushInt(7), &mut bytes);
    opcode::encode(Opcode::Exit, &mut bytes);

    // scene table entry: [entry, value_ip, name_ip]
    let mut scenes = HashMap::new();
    scenes.insert(0u32, vec![entry_ip, value_ip, name_ip]);

    let image = BinaryImage {
        string_table: vec!["main".to_string(), "unlocked".to_string()],
        translation_table: Vec::new(),
        translation_loaded: true,
        instructions: bytes,
        scenes,
        functions: HashMap::new(),
        definitions: HashMap::new(),
        external_functions: Vec::new(),
    };

    let mut vm = Vm::new(image, Box::new(MapRegistry::new()));
    vm.run_scene("main").unwrap();
    assert!(matches!(vm.get_flag("unlocked"), dnx_core::Value::Int(0)));
    vm.set_flag("unlocked", dnx_core::Value::Int(1));
    run_until_paused(&mut vm);
    assert!(vm.scene_completed());

    // First-write-wins (§4.3): the preamble sees the flag already present
    // and leaves the host's override in place on the second run.
    vm.run_scene("main").unwrap();
    assert!(matches!(vm.get_flag("unlocked"), dnx_core::Value::Int(1)));
}

//! Local-variable storage with a flag overlay (§9 design note, §4.2).
//!
//! Locals are a dense, index-addressed vector, same as the VM's operand
//! stack slots. An index can instead be *bound* to a persistent flag name:
//! once bound, reads and writes of that index route through the VM's flag
//! store rather than the local slot, which stays untouched.

use hashbrown::HashMap;

use crate::value::Value;
use crate::{String, Vec};

#[derive(Default)]
pub struct Locals {
    slots: Vec<Value>,
    flag_map: HashMap<i32, String>,
}

impl Locals {
    pub fn new() -> Locals {
        Locals { slots: Vec::new(), flag_map: HashMap::new() }
    }

    pub fn with_args(args: Vec<Value>) -> Locals {
        Locals { slots: args, flag_map: HashMap::new() }
    }

    pub fn flag_count(&self) -> usize {
        self.flag_map.len()
    }

    pub fn flag_name(&self, id: i32) -> Option<&str> {
        self.flag_map.get(&id).map(String::as_str)
    }

    pub fn bind_flag(&mut self, id: i32, name: String) {
        self.flag_map.insert(id, name);
    }

    /// Reads slot `id`. Flag-bound slots read through `flags` instead.
    pub fn get(&self, id: i32, flags: &HashMap<String, Value>) -> Value {
        if let Some(name) = self.flag_map.get(&id) {
            return flags.get(name).cloned().unwrap_or(Value::Undefined);
        }
        if id < 0 {
            return Value::Undefined;
        }
        self.slots.get(id as usize).cloned().unwrap_or(Value::Undefined)
    }

    /// Writes slot `id`, padding with `Undefined` up to `id` if it falls
    /// beyond the current slot count (§4.2: `SetVarLocal`). Flag-bound slots
    /// write through to `flags` instead, leaving the slot itself alone.
    pub fn set(&mut self, id: i32, value: Value, flags: &mut HashMap<String, Value>) {
        if let Some(name) = self.flag_map.get(&id) {
            flags.insert(name.clone(), value);
            return;
        }
        if id < 0 {
            return;
        }
        let idx = id as usize;
        if idx >= self.slots.len() {
            self.slots.resize(idx, Value::Undefined);
            self.slots.push(value);
        } else {
            self.slots[idx] = value;
        }
    }

    /// `FreeLocal id` (§4.2): removes the flag binding if `id` is bound,
    /// otherwise resets the slot to `Undefined` (indices stay stable, so a
    /// later read of a freed-but-unbound slot sees `Undefined` rather than a
    /// stale value).
    pub fn free(&mut self, id: i32) {
        if self.flag_map.remove(&id).is_some() {
            return;
        }
        if id < 0 {
            return;
        }
        if let Some(slot) = self.slots.get_mut(id as usize) {
            *slot = Value::Undefined;
        }
    }
}

//! The dispatch loop, the flag preamble driver and the choice/choose state
//! machine (§4.2–§4.5). This is the crate's single largest component; every
//! other module exists to feed it or to be fed by it.

use core::cell::RefCell;

use alloc::rc::Rc;
use hashbrown::HashMap;

use crate::error::{Fault, LookupKind, VmError};
use crate::host::{ChanceCallback, FunctionRegistry, SharedRandom, WeightedCallback};
use crate::image::BinaryImage;
use crate::interpolate;
use crate::opcode::{self, Opcode};
use crate::translation;
use crate::value::Value;
use crate::{Box, String, ToString, Vec};

use super::frame::Frame;
use super::locals::Locals;
use super::stack::Stack;

/// One accepted choice, as exposed to the host. `target` is the absolute
/// instruction offset `choose_choice` jumps to; it is not part of the public
/// surface (§6 lists only the text).
#[derive(Debug, Clone)]
pub struct ChoiceOption {
    pub text: String,
    pub(crate) target: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoiceState {
    Idle,
    InChoice,
    AwaitingSelection,
}

/// The stack-based dialogue VM (§3–§5).
pub struct Vm {
    image: Rc<RefCell<BinaryImage>>,
    registry: Box<dyn FunctionRegistry>,
    chance_cb: Box<dyn ChanceCallback>,
    weighted_cb: Box<dyn WeightedCallback>,

    stack: Stack<Value>,
    save_register: Value,
    locals: Locals,
    call_stack: Vec<Frame>,

    globals: HashMap<String, Value>,
    flags: HashMap<String, Value>,
    definitions_cache: HashMap<u32, Value>,

    ip: Option<usize>,
    paused: bool,
    has_run: bool,
    choice_state: ChoiceState,
    select_choice: bool,
    running_text: bool,
    scene_completed: bool,

    current_text: String,
    current_scene: Option<String>,
    choices: Vec<ChoiceOption>,
    choose_options: Vec<(f64, usize)>,
}

impl Vm {
    /// Constructs a paused VM with the default chance/weighted callbacks: a
    /// single VM-owned seedable RNG (§9), not freshly constructed per call.
    pub fn new(image: BinaryImage, registry: Box<dyn FunctionRegistry>) -> Vm {
        Self::with_seed(image, registry, 0x5EED)
    }

    pub fn with_seed(image: BinaryImage, registry: Box<dyn FunctionRegistry>, seed: u64) -> Vm {
        let random = SharedRandom::new(seed);
        Self::with_callbacks(image, registry, Box::new(random.clone()), Box::new(random))
    }

    pub fn with_callbacks(
        image: BinaryImage,
        registry: Box<dyn FunctionRegistry>,
        chance_cb: Box<dyn ChanceCallback>,
        weighted_cb: Box<dyn WeightedCallback>,
    ) -> Vm {
        Vm {
            image: Rc::new(RefCell::new(image)),
            registry,
            chance_cb,
            weighted_cb,
            stack: Stack::new(),
            save_register: Value::Undefined,
            locals: Locals::new(),
            call_stack: Vec::new(),
            globals: HashMap::new(),
            flags: HashMap::new(),
            definitions_cache: HashMap::new(),
            ip: None,
            paused: true,
            has_run: false,
            choice_state: ChoiceState::Idle,
            select_choice: false,
            running_text: false,
            scene_completed: true,
            current_text: String::new(),
            current_scene: None,
            choices: Vec::new(),
            choose_options: Vec::new(),
        }
    }

    // ---- read-only observables (§6) ----

    pub fn current_text(&self) -> &str {
        &self.current_text
    }

    pub fn current_scene(&self) -> Option<&str> {
        self.current_scene.as_deref()
    }

    pub fn choices(&self) -> &[ChoiceOption] {
        &self.choices
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn running_text(&self) -> bool {
        self.running_text
    }

    pub fn select_choice(&self) -> bool {
        self.select_choice
    }

    pub fn scene_completed(&self) -> bool {
        self.scene_completed
    }

    pub fn in_choice(&self) -> bool {
        self.choice_state == ChoiceState::InChoice
    }

    pub fn ip(&self) -> Option<usize> {
        self.ip
    }

    pub fn image(&self) -> Rc<RefCell<BinaryImage>> {
        self.image.clone()
    }

    // ---- flags ----

    pub fn get_flag(&self, name: &str) -> Value {
        self.flags.get(name).cloned().unwrap_or(Value::Undefined)
    }

    pub fn set_flag(&mut self, name: impl Into<String>, value: Value) {
        self.flags.insert(name.into(), value);
    }

    /// Encodes the persistent flag store as a compact postcard blob, for a
    /// host's save-game slot. Flags, not globals, are the part of VM state a
    /// script author actually expects to survive a scene restart (§3).
    #[cfg(feature = "serde")]
    pub fn save_flags(&self) -> Result<Vec<u8>, crate::error::SaveError> {
        postcard::to_allocvec(&self.flags).map_err(crate::error::SaveError::Encode)
    }

    /// Restores the flag store from a blob produced by [`Vm::save_flags`].
    /// Replaces the store wholesale rather than merging, mirroring how
    /// `set_translation_table` replaces the translation table wholesale.
    #[cfg(feature = "serde")]
    pub fn load_flags(&mut self, bytes: &[u8]) -> Result<(), crate::error::SaveError> {
        self.flags = postcard::from_bytes(bytes).map_err(crate::error::SaveError::Decode)?;
        Ok(())
    }

    /// Encodes the global-variable map as a compact postcard blob.
    #[cfg(feature = "serde")]
    pub fn save_globals(&self) -> Result<Vec<u8>, crate::error::SaveError> {
        postcard::to_allocvec(&self.globals).map_err(crate::error::SaveError::Encode)
    }

    /// Restores the global-variable map from a blob produced by
    /// [`Vm::save_globals`].
    #[cfg(feature = "serde")]
    pub fn load_globals(&mut self, bytes: &[u8]) -> Result<(), crate::error::SaveError> {
        self.globals = postcard::from_bytes(bytes).map_err(crate::error::SaveError::Decode)?;
        Ok(())
    }

    /// Replaces the translation table (§4.9) and invalidates cached
    /// definitions. Refused with a `StateError` while a scene is live (§5) —
    /// a silent swap would desync any VM still running against the old
    /// table without signaling it.
    pub fn load_translation_file(&mut self, text: &str) -> Result<(), Fault> {
        if self.has_run && !self.scene_completed {
            return Err(Fault::new(
                self.ip.unwrap_or(0),
                "<load_translation_file>",
                VmError::State("cannot reload translations while a scene is live"),
            ));
        }
        let entries = translation::parse(text);
        self.image.borrow_mut().set_translation_table(entries);
        self.definitions_cache.clear();
        Ok(())
    }

    /// Resolves (and caches, once translations are loaded) a definition's
    /// rendered string (§4.7).
    pub fn get_definition(&mut self, name: &str) -> Result<String, Fault> {
        let id = self
            .image
            .borrow()
            .symbol_id(name)
            .ok_or_else(|| Fault::new(0, "<definition>", VmError::lookup(LookupKind::Definition, name)))?;

        if let Some(cached) = self.definitions_cache.get(&id) {
            return Ok(cached.to_string());
        }

        let (string_ref, bytecode_offset) = {
            let image = self.image.borrow();
            let def = image
                .definitions
                .get(&id)
                .ok_or_else(|| Fault::new(0, "<definition>", VmError::lookup(LookupKind::Definition, name)))?;
            (def.resolve_ref(), def.bytecode_offset)
        };

        let template = self
            .image
            .borrow()
            .resolve_string_ref(string_ref)
            .map(String::from)
            .ok_or_else(|| Fault::new(0, "<definition>", VmError::lookup(LookupKind::Definition, name)))?;

        let args = match bytecode_offset {
            Some(offset) => {
                let mut produced = self.run_sub_execution(offset as usize)?;
                // Match the "first popped is args[0]" convention used by
                // `PushInterpolatedString`: the sub-execution's last-pushed
                // value is the one a real pop would see first.
                produced.reverse();
                produced
            }
            None => Vec::new(),
        };

        let rendered = interpolate::interpolate(&template, &args);
        if self.image.borrow().translation_loaded {
            self.definitions_cache.insert(id, Value::string(rendered.clone()));
        }
        Ok(rendered)
    }

    // ---- scene/host entry points ----

    /// Locates `name`, runs its flag preamble, and positions `ip` at its
    /// entry point, unpaused (§4.3, §6).
    pub fn run_scene(&mut self, name: &str) -> Result<(), Fault> {
        let offsets = self
            .image
            .borrow()
            .scene_offsets(name)
            .cloned()
            .ok_or_else(|| Fault::new(0, "<run_scene>", VmError::lookup(LookupKind::Scene, name)))?;
        let entry = *offsets.first().ok_or_else(|| {
            Fault::new(0, "<run_scene>", VmError::lookup(LookupKind::Scene, name))
        })?;

        self.locals = Locals::new();
        self.run_flag_preamble(&offsets[1..])?;

        self.current_scene = Some(name.to_string());
        self.scene_completed = false;
        self.has_run = true;
        self.ip = Some(entry as usize);
        self.paused = false;
        Ok(())
    }

    /// Executes exactly one instruction, or does nothing if paused (§5, §6).
    pub fn update(&mut self) -> Result<(), Fault> {
        if self.paused {
            return Ok(());
        }
        self.step()
    }

    /// Clears `running_text` and unpauses, unless a choice selection is
    /// still pending (§4.5).
    pub fn resume(&mut self) {
        self.running_text = false;
        if !self.select_choice {
            self.paused = false;
        }
    }

    /// Host response to `ChoiceSelect` (§4.4).
    pub fn choose_choice(&mut self, index: usize) -> Result<(), Fault> {
        if self.choice_state != ChoiceState::AwaitingSelection {
            return Err(Fault::new(
                self.ip.unwrap_or(0),
                "<choose_choice>",
                VmError::State("choose_choice called outside a pending selection"),
            ));
        }
        let len = self.choices.len();
        let target = self
            .choices
            .get(index)
            .map(|c| c.target)
            .ok_or_else(|| Fault::new(self.ip.unwrap_or(0), "<choose_choice>", VmError::bounds("choice", index as i64, len)))?;

        self.ip = Some(target);
        self.select_choice = false;
        self.choice_state = ChoiceState::Idle;
        self.choices.clear();
        self.paused = false;
        Ok(())
    }

    // ---- internals ----

    fn run_flag_preamble(&mut self, pairs: &[i32]) -> Result<(), Fault> {
        let mut idx = 0i32;
        let mut i = 0usize;
        while i + 1 < pairs.len() {
            let default_value = self.run_sub_execution_last(pairs[i] as usize)?;
            let name_value = self.run_sub_execution_last(pairs[i + 1] as usize)?;
            let name = name_value.to_string();
            if !self.flags.contains_key(&name) {
                self.flags.insert(name.clone(), default_value);
            }
            self.locals.bind_flag(idx, name);
            idx += 1;
            i += 2;
        }
        Ok(())
    }

    fn run_sub_execution_last(&mut self, start_ip: usize) -> Result<Value, Fault> {
        let mut produced = self.run_sub_execution(start_ip)?;
        Ok(produced.pop().unwrap_or(Value::Undefined))
    }

    /// Runs a bounded, reentrant inner activation starting at `start_ip`
    /// until it hits `Exit` (§9: "first Return/Exit/paused"), using a local,
    /// throwaway call stack so it can neither observe nor corrupt the
    /// outer activation's frames. Returns whatever the sub-execution left on
    /// the shared operand stack, oldest first. `TextRun`/`ChoiceSelect`
    /// inside a sub-execution are a `StateError` (§4.3) — the compiler never
    /// emits them there, so hitting one means a malformed image.
    ///
    /// `exec_exit` unconditionally clears `self.locals` when it finds an
    /// empty call stack (the case every sub-execution hits, since its call
    /// stack is always emptied below) — so `self.locals` has to be snapshotted
    /// and restored here too, the same as the other outer-activation fields,
    /// or a sub-execution silently wipes whatever locals the caller had just
    /// set up (e.g. a callee's freshly bound arguments).
    fn run_sub_execution(&mut self, start_ip: usize) -> Result<Vec<Value>, Fault> {
        let outer_ip = self.ip;
        let outer_paused = self.paused;
        let outer_scene_completed = self.scene_completed;
        let outer_running_text = self.running_text;
        let outer_select_choice = self.select_choice;
        let outer_call_stack = core::mem::take(&mut self.call_stack);
        let outer_locals = core::mem::take(&mut self.locals);
        let depth = self.stack.len();

        self.ip = Some(start_ip);
        self.paused = false;

        let result = self.drive_sub_execution();

        self.call_stack = outer_call_stack;
        self.locals = outer_locals;
        self.ip = outer_ip;
        self.paused = outer_paused;
        self.scene_completed = outer_scene_completed;
        self.running_text = outer_running_text;
        self.select_choice = outer_select_choice;

        result.map(|()| self.stack.split_off(depth))
    }

    fn drive_sub_execution(&mut self) -> Result<(), Fault> {
        loop {
            let ip = self.ip.ok_or_else(|| {
                Fault::new(0, "<sub-execution>", VmError::State("sub-execution ran past the end of the instruction stream"))
            })?;
            let (opcode, next_ip) = {
                let image = self.image.borrow();
                opcode::decode(&image.instructions, ip)?
            };
            if matches!(opcode, Opcode::TextRun | Opcode::ChoiceSelect) {
                return Err(Fault::new(
                    ip,
                    opcode.mnemonic(),
                    VmError::State("sub-execution must not suspend on text or a choice"),
                ));
            }
            self.ip = Some(next_ip);
            self.dispatch(opcode, ip, next_ip)?;
            if self.paused {
                return Ok(());
            }
        }
    }

    fn step(&mut self) -> Result<(), Fault> {
        let ip = self.ip.ok_or_else(|| {
            Fault::new(0, "<update>", VmError::State("update() called with no active instruction pointer"))
        })?;
        let (opcode, next_ip) = {
            let image = self.image.borrow();
            opcode::decode(&image.instructions, ip)?
        };
        self.ip = Some(next_ip);
        self.dispatch(opcode, ip, next_ip)
    }

    fn pop(&mut self, ip: usize, mnemonic: &'static str) -> Result<Value, Fault> {
        self.stack
            .pop()
            .ok_or_else(|| Fault::new(ip, mnemonic, VmError::Bounds { what: "operand stack", index: -1, len: 0 }))
    }

    fn jump_target(&self, next_ip: usize, rel: i32) -> usize {
        (next_ip as i64 + rel as i64) as usize
    }

    fn global_name(&self, ip: usize, mnemonic: &'static str, id: i32) -> Result<String, Fault> {
        self.image
            .borrow()
            .symbol_name(id as u32)
            .map(String::from)
            .ok_or_else(|| Fault::new(ip, mnemonic, VmError::bounds("string table", id as i64, 0)))
    }

    fn dispatch(&mut self, opcode: Opcode, ip: usize, next_ip: usize) -> Result<(), Fault> {
        let mnemonic = opcode.mnemonic();

        macro_rules! binop {
            ($method:ident) => {{
                let rhs = self.pop(ip, mnemonic)?;
                let lhs = self.pop(ip, mnemonic)?;
                let result = lhs.$method(&rhs).map_err(|e| Fault::new(ip, mnemonic, e))?;
                self.stack.push(result);
            }};
        }
        macro_rules! unop {
            ($method:ident) => {{
                let v = self.pop(ip, mnemonic)?;
                let result = v.$method().map_err(|e| Fault::new(ip, mnemonic, e))?;
                self.stack.push(result);
            }};
        }
        macro_rules! cmp {
            ($method:ident) => {{
                let rhs = self.pop(ip, mnemonic)?;
                let lhs = self.pop(ip, mnemonic)?;
                let result = lhs.$method(&rhs).map_err(|e| Fault::new(ip, mnemonic, e))?;
                self.stack.push(result);
            }};
        }

        match opcode {
            Opcode::Nop => {}

            Opcode::Save => {
                let top = self.stack.peek().cloned().ok_or_else(|| {
                    Fault::new(ip, mnemonic, VmError::Bounds { what: "operand stack", index: -1, len: 0 })
                })?;
                self.save_register = top;
            }
            Opcode::Load => {
                self.stack.push(self.save_register.clone());
            }
            Opcode::PushUndefined => self.stack.push(Value::Undefined),

            Opcode::PushArrayIndex => {
                let index = self.pop(ip, mnemonic)?;
                let array = self.pop(ip, mnemonic)?;
                let value = index_array(&array, &index, ip, mnemonic)?;
                self.stack.push(value);
            }
            Opcode::SetArrayIndex => {
                let value = self.pop(ip, mnemonic)?;
                let index = self.pop(ip, mnemonic)?;
                let array = self.pop(ip, mnemonic)?;
                set_array_index(&array, &index, value, ip, mnemonic)?;
                self.stack.push(array);
            }

            Opcode::Pop => {
                self.pop(ip, mnemonic)?;
            }
            Opcode::Duplicate => {
                let top = self.stack.peek().cloned().ok_or_else(|| {
                    Fault::new(ip, mnemonic, VmError::Bounds { what: "operand stack", index: -1, len: 0 })
                })?;
                self.stack.push(top);
            }
            Opcode::Duplicate2 => {
                let (a, b) = self.stack.peek_pair().ok_or_else(|| {
                    Fault::new(ip, mnemonic, VmError::Bounds { what: "operand stack", index: -1, len: self.stack.len() })
                })?;
                self.stack.push(a);
                self.stack.push(b);
            }

            Opcode::Addition => binop!(add),
            Opcode::Subtraction => binop!(sub),
            Opcode::Multiply => binop!(mul),
            Opcode::Divide => binop!(div),
            Opcode::Modulo => binop!(rem),
            Opcode::Negate => unop!(neg),
            Opcode::Invert => unop!(invert),
            Opcode::BitLeftShift => binop!(shl),
            Opcode::BitRightShift => binop!(shr),
            Opcode::BitAnd => binop!(bit_and),
            Opcode::BitOr => binop!(bit_or),
            Opcode::BitXor => binop!(bit_xor),
            Opcode::BitNegate => unop!(bit_not),
            Opcode::Power => binop!(pow),

            Opcode::CompareEq => {
                let rhs = self.pop(ip, mnemonic)?;
                let lhs = self.pop(ip, mnemonic)?;
                self.stack.push(lhs.eq_op(&rhs));
            }
            Opcode::CompareNeq => {
                let rhs = self.pop(ip, mnemonic)?;
                let lhs = self.pop(ip, mnemonic)?;
                self.stack.push(lhs.ne_op(&rhs));
            }
            Opcode::CompareGt => cmp!(gt),
            Opcode::CompareLt => cmp!(lt),
            Opcode::CompareGte => cmp!(ge),
            Opcode::CompareLte => cmp!(le),

            Opcode::Exit => self.exec_exit(),
            Opcode::Return => self.exec_return(ip, mnemonic)?,

            Opcode::ChoiceBegin => {
                if self.choice_state != ChoiceState::Idle {
                    return Err(Fault::new(ip, mnemonic, VmError::State("choice.begin while already in a choice")));
                }
                self.choice_state = ChoiceState::InChoice;
                self.choices.clear();
            }
            Opcode::ChoiceSelect => {
                if self.choice_state != ChoiceState::InChoice {
                    return Err(Fault::new(ip, mnemonic, VmError::State("choice.select outside a choice")));
                }
                if self.choices.is_empty() {
                    return Err(Fault::new(ip, mnemonic, VmError::State("choice.select with no accepted options")));
                }
                self.choice_state = ChoiceState::AwaitingSelection;
                self.select_choice = true;
                self.paused = true;
            }
            Opcode::ChooseSel => {
                if self.choose_options.is_empty() {
                    return Err(Fault::new(ip, mnemonic, VmError::State("choose.sel with no options")));
                }
                let weights: Vec<f64> = self.choose_options.iter().map(|(w, _)| *w).collect();
                let idx = self.weighted_cb.weighted(&weights);
                let target = usize::try_from(idx)
                    .ok()
                    .and_then(|i| self.choose_options.get(i).map(|(_, t)| *t))
                    .ok_or_else(|| {
                        Fault::new(ip, mnemonic, VmError::State("weighted callback returned an out-of-range index"))
                    })?;
                self.ip = Some(target);
                self.choose_options.clear();
            }
            Opcode::TextRun => {
                let text = self.pop(ip, mnemonic)?;
                self.current_text = text.to_string();
                self.running_text = true;
                self.paused = true;
            }

            Opcode::FreeLocal(id) => self.locals.free(id),
            Opcode::PushInt(v) => self.stack.push(Value::Int(v)),
            Opcode::PushString(id) => {
                let s = self.dialogue_string(ip, mnemonic, id)?;
                self.stack.push(Value::string(s));
            }
            Opcode::PushBinaryString(id) => {
                let s = self.internal_string(ip, mnemonic, id)?;
                self.stack.push(Value::string(s));
            }
            Opcode::MakeArray(n) => {
                let mut elements = Vec::with_capacity(n.max(0) as usize);
                for _ in 0..n.max(0) {
                    elements.push(self.pop(ip, mnemonic)?);
                }
                self.stack.push(Value::array(elements));
            }
            Opcode::SetVarGlobal(id) => {
                let value = self.pop(ip, mnemonic)?;
                let name = self.global_name(ip, mnemonic, id)?;
                self.globals.insert(name, value);
            }
            Opcode::SetVarLocal(id) => {
                let value = self.pop(ip, mnemonic)?;
                self.locals.set(id, value, &mut self.flags);
            }
            Opcode::PushVarGlobal(id) => {
                let name = self.global_name(ip, mnemonic, id)?;
                let value = self.globals.get(&name).cloned().unwrap_or(Value::Undefined);
                self.stack.push(value);
            }
            Opcode::PushVarLocal(id) => {
                let value = self.locals.get(id, &self.flags);
                self.stack.push(value);
            }
            Opcode::Jump(rel) => self.ip = Some(self.jump_target(next_ip, rel)),
            Opcode::JumpTruthy(rel) => {
                let v = self.pop(ip, mnemonic)?;
                if v.truthy() {
                    self.ip = Some(self.jump_target(next_ip, rel));
                }
            }
            Opcode::JumpFalsey(rel) => {
                let v = self.pop(ip, mnemonic)?;
                if !v.truthy() {
                    self.ip = Some(self.jump_target(next_ip, rel));
                }
            }

            Opcode::ChoiceAdd(rel) => self.exec_choice_add(ip, mnemonic, next_ip, rel, true)?,
            Opcode::ChoiceAddTruthy(rel) => self.exec_choice_add(ip, mnemonic, next_ip, rel, false)?,
            Opcode::ChooseAdd(rel) => self.exec_choose_add(ip, mnemonic, next_ip, rel, true)?,
            Opcode::ChooseAddTruthy(rel) => self.exec_choose_add(ip, mnemonic, next_ip, rel, false)?,

            Opcode::PushInterpolatedString(template_id, argc) => {
                let template = self.dialogue_string(ip, mnemonic, template_id)?;
                let args = self.pop_args(ip, mnemonic, argc)?;
                self.stack.push(Value::string(interpolate::interpolate(&template, &args)));
            }
            Opcode::PushBinaryInterpolatedString(template_id, argc) => {
                let template = self.internal_string(ip, mnemonic, template_id)?;
                let args = self.pop_args(ip, mnemonic, argc)?;
                self.stack.push(Value::string(interpolate::interpolate(&template, &args)));
            }
            Opcode::Call(fn_index, argc) => self.exec_call(ip, mnemonic, next_ip, fn_index, argc)?,
            Opcode::CallExternal(name_id, argc) => self.exec_call_external(ip, mnemonic, name_id, argc)?,

            Opcode::PushDouble(v) => self.stack.push(Value::Double(v)),
        }
        Ok(())
    }

    /// Pops `argc` values; the first one popped becomes `args[0]` (same
    /// "first popped, index 0" convention as `MakeArray`/`Call`).
    fn pop_args(&mut self, ip: usize, mnemonic: &'static str, argc: i32) -> Result<Vec<Value>, Fault> {
        let mut args = Vec::with_capacity(argc.max(0) as usize);
        for _ in 0..argc.max(0) {
            args.push(self.pop(ip, mnemonic)?);
        }
        Ok(args)
    }

    /// Reads a translatable, user-facing string (§3 glossary); fails (after
    /// a `tracing::warn!`, §7) if no translation table has been loaded yet.
    fn dialogue_string(&self, ip: usize, mnemonic: &'static str, id: i32) -> Result<String, Fault> {
        let image = self.image.borrow();
        if !image.translation_loaded {
            tracing::warn!(opcode = mnemonic, ip, "dialogue opcode executed before a translation table was loaded");
            return Err(Fault::new(ip, mnemonic, VmError::TranslationNotLoaded));
        }
        image
            .translation_table
            .get(id as usize)
            .cloned()
            .ok_or_else(|| Fault::new(ip, mnemonic, VmError::bounds("translation table", id as i64, image.translation_table.len())))
    }

    /// Reads an internal, non-translatable string (symbol names,
    /// external-function names, `Binary*` string literals — §3).
    fn internal_string(&self, ip: usize, mnemonic: &'static str, id: i32) -> Result<String, Fault> {
        let image = self.image.borrow();
        image
            .string_table
            .get(id as usize)
            .cloned()
            .ok_or_else(|| Fault::new(ip, mnemonic, VmError::bounds("string table", id as i64, image.string_table.len())))
    }

    fn exec_choice_add(
        &mut self,
        ip: usize,
        mnemonic: &'static str,
        next_ip: usize,
        rel: i32,
        unconditional: bool,
    ) -> Result<(), Fault> {
        if self.choice_state != ChoiceState::InChoice {
            return Err(Fault::new(ip, mnemonic, format_state_error(mnemonic)));
        }
        let chance = self.pop(ip, mnemonic)?;
        let text = self.pop(ip, mnemonic)?;
        let guard_ok = if unconditional {
            true
        } else {
            let guard = self.pop(ip, mnemonic)?;
            guard.truthy()
        };
        let chance_value = chance.as_double().ok_or_else(|| {
            Fault::new(ip, mnemonic, VmError::type_mismatch("choice.add chance", chance.type_name(), "double"))
        })?;
        if guard_ok && self.chance_cb.chance(chance_value) {
            self.choices.push(ChoiceOption { text: text.to_string(), target: self.jump_target(next_ip, rel) });
        }
        Ok(())
    }

    fn exec_choose_add(
        &mut self,
        ip: usize,
        mnemonic: &'static str,
        next_ip: usize,
        rel: i32,
        unconditional: bool,
    ) -> Result<(), Fault> {
        let guard_ok = if unconditional {
            true
        } else {
            let guard = self.pop(ip, mnemonic)?;
            guard.truthy()
        };
        let chance = self.pop(ip, mnemonic)?;
        if !guard_ok {
            return Ok(());
        }
        let chance_value = chance.as_double().ok_or_else(|| {
            Fault::new(ip, mnemonic, VmError::type_mismatch("choose.add chance", chance.type_name(), "double"))
        })?;
        self.choose_options.push((chance_value, self.jump_target(next_ip, rel)));
        Ok(())
    }

    fn exec_exit(&mut self) {
        self.locals = Locals::new();
        match self.call_stack.pop() {
            None => {
                self.ip = None;
                self.paused = true;
                self.scene_completed = true;
            }
            Some(frame) => {
                self.locals = frame.locals;
                self.save_register = frame.save_register;
                self.ip = Some(frame.return_ip);
                self.stack.push(Value::Undefined);
            }
        }
    }

    fn exec_return(&mut self, ip: usize, mnemonic: &'static str) -> Result<(), Fault> {
        let value = self.pop(ip, mnemonic)?;
        match self.call_stack.pop() {
            None => Err(Fault::new(ip, mnemonic, VmError::State("return with an empty call stack"))),
            Some(frame) => {
                self.locals = frame.locals;
                self.save_register = frame.save_register;
                self.ip = Some(frame.return_ip);
                self.stack.push(value);
                Ok(())
            }
        }
    }

    fn exec_call(&mut self, ip: usize, mnemonic: &'static str, next_ip: usize, fn_index: i32, argc: i32) -> Result<(), Fault> {
        let offsets = self
            .image
            .borrow()
            .function_offsets_by_id(fn_index as u32)
            .cloned()
            .ok_or_else(|| Fault::new(ip, mnemonic, VmError::lookup(LookupKind::Function, format_id(fn_index))))?;
        let entry = *offsets
            .first()
            .ok_or_else(|| Fault::new(ip, mnemonic, VmError::lookup(LookupKind::Function, format_id(fn_index))))?;

        let args = self.pop_args(ip, mnemonic, argc)?;

        let outer_locals = core::mem::replace(&mut self.locals, Locals::with_args(args));
        let outer_save = core::mem::replace(&mut self.save_register, Value::Undefined);
        self.call_stack.push(Frame { return_ip: next_ip, locals: outer_locals, save_register: outer_save });

        self.run_flag_preamble(&offsets[1..])?;
        self.ip = Some(entry as usize);
        Ok(())
    }

    fn exec_call_external(&mut self, ip: usize, mnemonic: &'static str, name_id: i32, argc: i32) -> Result<(), Fault> {
        let name = self.internal_string(ip, mnemonic, name_id)?;
        let args = self.pop_args(ip, mnemonic, argc)?;
        let result = self.registry.invoke(&name, &args).map_err(|e| Fault::new(ip, mnemonic, e))?;
        self.stack.push(result);
        Ok(())
    }
}

fn format_state_error(mnemonic: &'static str) -> VmError {
    VmError::State(match mnemonic {
        "choice.add" => "choice.add outside a choice",
        "choice.add_truthy" => "choice.add_truthy outside a choice",
        _ => "choice opcode used outside a choice",
    })
}

fn format_id(id: i32) -> String {
    crate::format!("{id}")
}

fn index_array(array: &Value, index: &Value, ip: usize, mnemonic: &'static str) -> Result<Value, Fault> {
    let Value::Array(handle) = array else {
        return Err(Fault::new(ip, mnemonic, VmError::type_mismatch("array index", array.type_name(), "array")));
    };
    let i = index_as_usize(index, ip, mnemonic)?;
    let borrowed = handle.borrow();
    borrowed
        .get(i)
        .cloned()
        .ok_or_else(|| Fault::new(ip, mnemonic, VmError::bounds("array", i as i64, borrowed.len())))
}

fn set_array_index(array: &Value, index: &Value, value: Value, ip: usize, mnemonic: &'static str) -> Result<(), Fault> {
    let Value::Array(handle) = array else {
        return Err(Fault::new(ip, mnemonic, VmError::type_mismatch("array index", array.type_name(), "array")));
    };
    let i = index_as_usize(index, ip, mnemonic)?;
    let mut borrowed = handle.borrow_mut();
    let len = borrowed.len();
    let slot = borrowed.get_mut(i).ok_or_else(|| Fault::new(ip, mnemonic, VmError::bounds("array", i as i64, len)))?;
    *slot = value;
    Ok(())
}

fn index_as_usize(index: &Value, ip: usize, mnemonic: &'static str) -> Result<usize, Fault> {
    match index {
        Value::Int(i) if *i >= 0 => Ok(*i as usize),
        Value::Int(i) => Err(Fault::new(ip, mnemonic, VmError::bounds("array", *i as i64, 0))),
        other => Err(Fault::new(ip, mnemonic, VmError::type_mismatch("array index", other.type_name(), "int"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MapRegistry;
    use crate::image::Definition;
    use crate::opcode::encode;
    use crate::vec;
    use pretty_assertions::assert_eq;

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

    fn vm_with(instructions: Vec<u8>) -> Vm {
        Vm::new(image_with_scene("main", instructions), Box::new(MapRegistry::new()))
    }

    fn run_until_paused(vm: &mut Vm) {
        while !vm.paused() {
            vm.update().unwrap();
        }
    }

    #[test]
    fn arithmetic_and_promotion() {
        let mut bytes = Vec::new();
        encode(Opcode::PushInt(3), &mut bytes);
        encode(Opcode::PushInt(4), &mut bytes);
        encode(Opcode::Addition, &mut bytes);
        encode(Opcode::Exit, &mut bytes);

        let mut vm = vm_with(bytes);
        vm.run_scene("main").unwrap();
        run_until_paused(&mut vm);

        assert!(vm.scene_completed());
        assert!(matches!(vm.stack.peek(), Some(Value::Int(7))));
    }

    #[test]
    fn mixed_promotion_interpolated_text() {
        let mut bytes = Vec::new();
        encode(Opcode::PushInt(3), &mut bytes);
        encode(Opcode::PushDouble(0.5), &mut bytes);
        encode(Opcode::Addition, &mut bytes);
        encode(Opcode::PushBinaryInterpolatedString(1, 1), &mut bytes);
        encode(Opcode::TextRun, &mut bytes);

        let mut image = image_with_scene("main", bytes);
        image.string_table.push("{0}".to_string());
        let mut vm = Vm::new(image, Box::new(MapRegistry::new()));
        vm.run_scene("main").unwrap();
        run_until_paused(&mut vm);

        assert_eq!(vm.current_text(), "3.5");
        assert!(vm.running_text());
    }

    #[test]
    fn choice_happy_path_and_selection() {
        let mut bytes = Vec::new();
        encode(Opcode::ChoiceBegin, &mut bytes);
        encode(Opcode::PushBinaryString(1), &mut bytes);
        encode(Opcode::PushDouble(1.0), &mut bytes);
        encode(Opcode::ChoiceAdd(10), &mut bytes);
        encode(Opcode::PushBinaryString(2), &mut bytes);
        encode(Opcode::PushDouble(1.0), &mut bytes);
        encode(Opcode::ChoiceAdd(20), &mut bytes);
        encode(Opcode::ChoiceSelect, &mut bytes);

        let mut image = image_with_scene("main", bytes);
        image.string_table.push("A".to_string());
        image.string_table.push("B".to_string());
        let mut vm = Vm::new(image, Box::new(MapRegistry::new()));
        vm.run_scene("main").unwrap();
        run_until_paused(&mut vm);

        assert!(vm.select_choice());
        assert_eq!(vm.choices().len(), 2);
        assert_eq!(vm.choices()[0].text, "A");
        assert_eq!(vm.choices()[1].text, "B");

        let second_target = vm.choices()[1].target;
        vm.choose_choice(1).unwrap();
        assert!(!vm.select_choice());
        assert!(!vm.in_choice());
        assert!(vm.choices().is_empty());
        assert_eq!(vm.ip(), Some(second_target));
    }

    #[test]
    fn truthy_choice_is_filtered_out() {
        let mut bytes = Vec::new();
        encode(Opcode::ChoiceBegin, &mut bytes);
        encode(Opcode::PushInt(0), &mut bytes);
        encode(Opcode::PushBinaryString(1), &mut bytes);
        encode(Opcode::PushDouble(1.0), &mut bytes);
        encode(Opcode::ChoiceAddTruthy(10), &mut bytes);
        encode(Opcode::PushBinaryString(2), &mut bytes);
        encode(Opcode::PushDouble(1.0), &mut bytes);
        encode(Opcode::ChoiceAdd(20), &mut bytes);
        encode(Opcode::ChoiceSelect, &mut bytes);

        let mut image = image_with_scene("main", bytes);
        image.string_table.push("guarded".to_string());
        image.string_table.push("always".to_string());
        let mut vm = Vm::new(image, Box::new(MapRegistry::new()));
        vm.run_scene("main").unwrap();
        run_until_paused(&mut vm);

        assert_eq!(vm.choices().len(), 1);
        assert_eq!(vm.choices()[0].text, "always");
    }

    #[test]
    fn weighted_choose_selects_by_callback_index() {
        let mut bytes = Vec::new();
        encode(Opcode::PushDouble(1.0), &mut bytes);
        encode(Opcode::ChooseAdd(10), &mut bytes);
        encode(Opcode::PushDouble(3.0), &mut bytes);
        encode(Opcode::ChooseAdd(20), &mut bytes);
        encode(Opcode::ChooseSel, &mut bytes);

        struct AlwaysSecond;
        impl ChanceCallback for AlwaysSecond {
            fn chance(&mut self, _p: f64) -> bool {
                true
            }
        }
        impl WeightedCallback for AlwaysSecond {
            fn weighted(&mut self, _weights: &[f64]) -> i32 {
                1
            }
        }

        let image = image_with_scene("main", bytes);
        let mut vm = Vm::with_callbacks(image, Box::new(MapRegistry::new()), Box::new(AlwaysSecond), Box::new(AlwaysSecond));
        vm.run_scene("main").unwrap();

        let expected_target = vm.ip().unwrap();
        // First two instructions just build the option list.
        vm.update().unwrap();
        vm.update().unwrap();
        vm.update().unwrap();
        vm.update().unwrap();
        vm.update().unwrap();

        assert!(vm.choose_options.is_empty());
        assert_ne!(vm.ip(), Some(expected_target));
    }

    #[test]
    fn flag_preamble_first_write_wins() {
        let mut bytes = Vec::new();
        let entry_placeholder = 0i32;
        // default-value sub-execution: PushInt 0; Exit
        let default_offset = bytes.len() as i32;
        encode(Opcode::PushInt(0), &mut bytes);
        encode(Opcode::Exit, &mut bytes);
        // flag-name sub-execution: PushBinaryString 1 ("coins"); Exit
        let name_offset = bytes.len() as i32;
        encode(Opcode::PushBinaryString(1), &mut bytes);
        encode(Opcode::Exit, &mut bytes);
        // scene entry: Exit immediately.
        let entry = bytes.len() as i32;
        encode(Opcode::Exit, &mut bytes);
        let _ = entry_placeholder;

        let mut scenes = HashMap::new();
        scenes.insert(0u32, vec![entry, default_offset, name_offset]);

        let image = BinaryImage {
            string_table: vec!["main".to_string(), "coins".to_string()],
            translation_table: Vec::new(),
            translation_loaded: true,
            instructions: bytes,
            scenes,
            functions: HashMap::new(),
            definitions: HashMap::new(),
            external_functions: Vec::new(),
        };

        let mut vm = Vm::new(image, Box::new(MapRegistry::new()));
        vm.set_flag("coins", Value::Int(42));
        vm.run_scene("main").unwrap();

        assert!(matches!(vm.get_flag("coins"), Value::Int(42)));
    }

    /// A scene table with two flag pairs must bind both, not just the last
    /// one: each pair's sub-execution runs and returns to the outer
    /// activation without disturbing the bindings the earlier pair already
    /// made in `locals.flag_map` (SPEC_FULL.md's "k flag pairs, k bindings"
    /// property — regression for `run_sub_execution` clobbering `self.locals`
    /// on every `Exit`, which used to leave only the last pair bound).
    #[test]
    fn flag_preamble_binds_every_pair_not_just_the_last() {
        let mut bytes = Vec::new();

        let coins_default = bytes.len() as i32;
        encode(Opcode::PushInt(0), &mut bytes);
        encode(Opcode::Exit, &mut bytes);
        let coins_name = bytes.len() as i32;
        encode(Opcode::PushBinaryString(1), &mut bytes); // "coins"
        encode(Opcode::Exit, &mut bytes);

        let met_default = bytes.len() as i32;
        encode(Opcode::PushInt(0), &mut bytes);
        encode(Opcode::Exit, &mut bytes);
        let met_name = bytes.len() as i32;
        encode(Opcode::PushBinaryString(2), &mut bytes); // "met_wizard"
        encode(Opcode::Exit, &mut bytes);

        let entry = bytes.len() as i32;
        encode(Opcode::Exit, &mut bytes);

        let mut scenes = HashMap::new();
        scenes.insert(0u32, vec![entry, coins_default, coins_name, met_default, met_name]);

        let image = BinaryImage {
            string_table: vec!["main".to_string(), "coins".to_string(), "met_wizard".to_string()],
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

        assert_eq!(vm.locals.flag_count(), 2);
        assert_eq!(vm.locals.flag_name(0), Some("coins"));
        assert_eq!(vm.locals.flag_name(1), Some("met_wizard"));
        assert!(matches!(vm.get_flag("coins"), Value::Int(0)));
        assert!(matches!(vm.get_flag("met_wizard"), Value::Int(0)));
    }

    /// `Call`'s popped arguments must still be in `locals` by the time the
    /// callee's body runs, even when the callee has a flag preamble —
    /// regression for the preamble's sub-executions wiping out the
    /// `Locals::with_args(args)` that `exec_call` had just installed.
    #[test]
    fn call_arguments_survive_a_callees_flag_preamble() {
        let mut bytes = Vec::new();

        let default_offset = bytes.len() as i32;
        encode(Opcode::PushInt(0), &mut bytes);
        encode(Opcode::Exit, &mut bytes);
        let name_offset = bytes.len() as i32;
        encode(Opcode::PushBinaryString(1), &mut bytes); // "unlocked"
        encode(Opcode::Exit, &mut bytes);

        // callee: local 0 holds the caller's argument; return it unchanged.
        let callee_entry = bytes.len() as i32;
        encode(Opcode::PushVarLocal(0), &mut bytes);
        encode(Opcode::Return, &mut bytes);

        // main: call callee(9), then exit with the result still on the stack.
        let main_entry = bytes.len() as i32;
        encode(Opcode::PushInt(9), &mut bytes);
        encode(Opcode::Call(0, 1), &mut bytes);
        encode(Opcode::Exit, &mut bytes);

        let mut scenes = HashMap::new();
        scenes.insert(0u32, vec![main_entry]);
        let mut functions = HashMap::new();
        functions.insert(0u32, vec![callee_entry, default_offset, name_offset]);

        let image = BinaryImage {
            string_table: vec!["main".to_string(), "unlocked".to_string()],
            translation_table: Vec::new(),
            translation_loaded: true,
            instructions: bytes,
            scenes,
            functions,
            definitions: HashMap::new(),
            external_functions: Vec::new(),
        };

        let mut vm = Vm::new(image, Box::new(MapRegistry::new()));
        vm.run_scene("main").unwrap();

        assert!(matches!(vm.stack.peek().unwrap(), Value::Int(9)));
    }

    #[test]
    fn definition_with_tagged_translation_reference() {
        let mut definitions = HashMap::new();
        definitions.insert(0u32, Definition { string_ref: 0x8000_0000, bytecode_offset: None });
        let image = BinaryImage {
            string_table: vec!["greeting".to_string()],
            translation_table: vec!["hello there".to_string()],
            translation_loaded: true,
            instructions: Vec::new(),
            scenes: HashMap::new(),
            functions: HashMap::new(),
            definitions,
            external_functions: Vec::new(),
        };
        let mut vm = Vm::new(image, Box::new(MapRegistry::new()));
        assert_eq!(vm.get_definition("greeting").unwrap(), "hello there");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn flags_round_trip_through_a_postcard_blob() {
        let mut vm = vm_with(Vec::new());
        vm.set_flag("seen_intro", Value::Int(1));
        vm.set_flag("player_name", Value::string("Avery"));

        let blob = vm.save_flags().unwrap();

        let mut restored = vm_with(Vec::new());
        restored.load_flags(&blob).unwrap();

        assert!(matches!(restored.get_flag("seen_intro"), Value::Int(1)));
        assert_eq!(restored.get_flag("player_name").to_string(), "Avery");
        assert!(matches!(restored.get_flag("never_set"), Value::Undefined));
    }
}

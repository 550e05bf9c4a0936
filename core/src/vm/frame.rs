//! A saved call-site (§3, §4.2 `Call`/`Return`/`Exit`): what the VM restores
//! when a function activation ends.

use crate::value::Value;

use super::locals::Locals;

pub struct Frame {
    pub return_ip: usize,
    pub locals: Locals,
    pub save_register: Value,
}

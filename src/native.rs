//! §6 "Native surface" — the one built-in function a freestanding VM
//! needs to be useful for the timing-sensitive recursion tests in §8:
//! `clock()`.

use std::time::Instant;

use super::object::NativeObj;
use super::value::Value;

pub fn clock_native(_args: &[Value]) -> Result<Value, String> {
    CLOCK_START.with(|start| Ok(Value::Number(start.elapsed().as_secs_f64())))
}

thread_local! {
    static CLOCK_START: Instant = Instant::now();
}

pub fn clock() -> NativeObj {
    NativeObj {
        arity: 0,
        name: "clock",
        function: clock_native,
    }
}

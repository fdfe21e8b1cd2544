//! Module that contains the console logging helpers shared by every actor.

use color_print::{ceprintln, cprintln};
use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG: AtomicBool = AtomicBool::new(false);

/// Function that turns debug output on or off for the whole process.
pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
}

/// Function that tells if debug output is enabled.
pub fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

pub fn debug(msg: &str) {
    if debug_enabled() {
        cprintln!("<dim>[DEBUG]</dim> {}", msg);
    }
}

pub fn info(msg: &str) {
    cprintln!("<green, bold>[INFO]</green, bold> {}", msg);
}

pub fn warn(msg: &str) {
    cprintln!("<yellow, bold>[WARN]</yellow, bold> {}", msg);
}

pub fn error(msg: &str) {
    ceprintln!("<red, bold>[ERROR]</red, bold> {}", msg);
}

//! Command channel vocabulary
//!
//! Commands are short ASCII strings, one per datagram-style recv, matched
//! exactly and case-sensitively. Unknown commands are silently ignored. The
//! same vocabulary is driven by the TTY keys, so both frontends talk to the
//! pipeline through [`CommandSink`].

/// Maximum accepted command length in bytes.
pub const MAX_COMMAND_LEN: usize = 99;

/// Which of the two page-dependent parameters a command adjusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Primary,
    Secondary,
}

/// Callbacks the command reader invokes on the pipeline.
pub trait CommandSink: Send + Sync {
    /// Log the status counters.
    fn output_status(&self);
    /// Log the current configuration.
    fn output_config(&self);
    /// Advance the image processing mode (wraps).
    fn cycle_mode(&self);
    /// Advance the parameter page (wraps).
    fn next_page(&self);
    /// Adjust a page-dependent parameter.
    fn adjust_param(&self, param: Param, up: bool);
    /// One-shot debug trigger.
    fn debug_trigger(&self);
    /// Toggle persistent debug mode.
    fn toggle_debug_mode(&self);
}

/// Dispatch one received command. Returns whether it was recognized.
pub fn dispatch(sink: &dyn CommandSink, command: &str) -> bool {
    match command {
        "status" => sink.output_status(),
        "config" => sink.output_config(),
        "mode" => sink.cycle_mode(),
        "page" => sink.next_page(),
        "param1 up" => sink.adjust_param(Param::Primary, true),
        "param1 down" => sink.adjust_param(Param::Primary, false),
        "param2 up" => sink.adjust_param(Param::Secondary, true),
        "param2 down" => sink.adjust_param(Param::Secondary, false),
        "debug" => sink.debug_trigger(),
        "debugmode" => sink.toggle_debug_mode(),
        _ => return false,
    }
    true
}

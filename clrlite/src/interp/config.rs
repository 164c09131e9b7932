/// Tunables for one interpreter instance. Defaults match spec §4.6's
/// deterministic-by-default stance: locals are always zeroed even when a
/// body sets `init.locals = false`, and recursion is bounded to turn runaway
/// managed recursion into a catchable-from-the-host `StackOverflow` error
/// instead of exhausting the real call stack.
#[derive(Debug, Clone, Copy)]
pub struct Config {
	pub max_call_depth: usize,
}

impl Default for Config {
	fn default() -> Self {
		Self { max_call_depth: 2048 }
	}
}

use log::error;
use std::panic;

pub fn initialize_panic_handler() {
    better_panic::install();

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        // Also lands in the log file; worker panics never reach stderr.
        error!("Panic: {panic_info}");
        default_hook(panic_info);
    }));
}

pub mod config;
pub mod error;
pub mod backend;
pub mod identity;
pub mod routes;
pub mod tasks;
pub mod server;

// Debug-trace printing helper: expands to eprintln! in test and debug builds.
// Usage: tprintln!("session.issue user={}", user);
#[cfg(any(test, debug_assertions))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ( eprintln!($($arg)*) );
}

// In release builds, provide a no-op tprintln! so calls compile without effect.
#[cfg(not(any(test, debug_assertions)))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ({
        // Preserve formatting checks in release without producing code
        if false { let _ = format!($($arg)*); }
    });
}

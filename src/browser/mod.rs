//! Browser automation: supervised process, driver protocol, controller
//!
//! One [`Browser`] bundles a supervised driver process, an intercepting
//! proxy, and a WebDriver session, and exposes the navigation/exploration
//! surface workers drive jobs through.

pub mod controller;
pub mod driver;
pub mod instrumentation;
pub mod process;

pub use controller::{Browser, EventElement};
pub use driver::{Driver, DriverError, ElementRef};
pub use process::{BrowserError, BrowserProcess};

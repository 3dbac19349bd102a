//! Accounting core of the vramcap interposition layer.
//!
//! Holds everything that can be exercised without a preloaded library: the
//! quota policy, the entry-point binding table, the replacement logic and the
//! symbol redirect table. `vramcap-interpose` exports the C symbols on top.

pub mod binding;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod ffi;
pub mod interceptor;
pub mod policy;
pub mod redirect;

pub use binding::{DriverBindings, EntryPoint, LazyBinding, SymbolResolver};
pub use bootstrap::Bootstrap;
pub use config::VramcapConfig;
pub use error::CoreError;
pub use interceptor::Interceptor;
pub use policy::{CapacityTriple, Enforcement, QuotaPolicy};
pub use redirect::RedirectTable;

pub mod cache;
pub mod registrar;
pub mod resolver;

pub use cache::{BoundedCache, DEFAULT_CACHE_CAPACITY};
pub use registrar::{ApplicationRegistrar, UNKNOWN_APPLICATION, derive_name};
pub use resolver::IdentityResolver;

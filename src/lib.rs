pub mod address_map;
pub mod config;
pub mod config_store;
#[cfg(unix)]
pub mod daemon;
pub mod interceptor;
pub mod milter;
pub mod mime;
pub mod sanitize;
pub mod subject;

pub use address_map::{AddressMapping, MappingError};
pub use config::Config;
pub use config_store::{ConfigStore, MappingSource, ReloadOutcome};
pub use interceptor::{Disposition, Message, MessageError, MessageInterceptor, RewriteSettings};
pub use milter::Milter;
pub use mime::MimeMessage;

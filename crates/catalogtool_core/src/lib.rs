pub mod assets;
pub mod catalog;
pub mod config;
pub mod external;
pub mod fallbacks;
pub mod index;
pub mod links;
pub mod migrate;
pub mod preview;
pub mod redirects;
pub mod runtime;

pub mod config;
pub mod error;
pub mod fetch;
pub mod http;
pub mod index;
pub mod links;
pub mod pads;
pub mod render;
#[cfg(test)]
mod testing;
pub mod wikis;

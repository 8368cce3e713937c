pub mod capability;
pub mod folder_filter;
mod loader;

use crate::{bus::EventBus, session::Session};
use std::{path, sync::Arc};

pub use loader::load_external;

/// A plugin observes or rewrites traffic for a session by registering closures on the two buses
/// handed to it. `register` runs once per connection; state that must survive across calls lives
/// in closures captured there, not on `self` (the same `Plugin` value is shared across every
/// connection).
pub trait Plugin: Send + Sync {
  fn name(&self) -> &str;
  fn register(&self, session: &Arc<Session>, client_bus: &mut EventBus, server_bus: &mut EventBus);
}

/// Builds the plugin registry: the two always-on built-ins, plus any dynamic-library plugin found
/// in `plugins_dir`. A plugin that fails to load is logged and skipped; it never aborts startup.
pub fn load_all(plugins_dir: &path::Path) -> Vec<Box<dyn Plugin>> {
  let mut plugins: Vec<Box<dyn Plugin>> = vec![
    Box::new(capability::CapabilityRewriter),
    Box::new(folder_filter::FolderFilter),
  ];
  plugins.extend(load_external(plugins_dir));
  plugins
}

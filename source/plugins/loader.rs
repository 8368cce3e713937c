use crate::plugins::Plugin;
use std::{fs, path};

/// Third-party plugins export this symbol, returning a freshly boxed `Plugin` as a raw trait
/// object pointer. This only works reliably between a host and plugin built with the same
/// compiler version: there is no stable Rust ABI for trait objects. That narrow, documented
/// unsafety is the price of loading plugins without inventing a C-style vtable of our own.
pub type PluginConstructor = unsafe extern "C" fn() -> *mut dyn Plugin;

const SYMBOL: &[u8] = b"imaproxy_plugin_create";

/// Loads every recognized dynamic library in `dir`, skipping (with a logged reason) anything that
/// fails to open or doesn't export `imaproxy_plugin_create`. A missing directory is not an error:
/// it simply means no third-party plugins are configured.
pub fn load_external(dir: &path::Path) -> Vec<Box<dyn Plugin>> {
  let entries = match fs::read_dir(dir) {
    Ok(entries) => entries,
    Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
    Err(error) => {
      log::warn!("couldn't read plugin directory {dir:?}: {error}");
      return Vec::new();
    }
  };

  let mut plugins = Vec::new();
  for entry in entries.flatten() {
    let path = entry.path();
    if !is_dynamic_library(&path) {
      continue;
    }
    match load_one(&path) {
      Ok(plugin) => {
        log::info!("loaded plugin {:?} from {path:?}", plugin.name());
        plugins.push(plugin);
      }
      Err(error) => log::warn!("skipping plugin {path:?}: {error:#}"),
    }
  }
  plugins
}

fn is_dynamic_library(path: &path::Path) -> bool {
  matches!(
    path.extension().and_then(|ext| ext.to_str()),
    Some("so") | Some("dylib") | Some("dll")
  )
}

fn load_one(path: &path::Path) -> anyhow::Result<Box<dyn Plugin>> {
  // SAFETY: running a third-party dynamic library's initializer is inherently unsafe; the
  // boundary we control is limited to requiring the exact symbol signature below.
  unsafe {
    let library = libloading::Library::new(path)?;
    let constructor: libloading::Symbol<PluginConstructor> = library.get(SYMBOL)?;
    let raw = constructor();
    anyhow::ensure!(!raw.is_null(), "{SYMBOL:?} returned a null pointer");
    let plugin = Box::from_raw(raw);
    // Leak the library handle: unloading while the plugin's vtable is still reachable from a
    // live `Box<dyn Plugin>` would be unsound, and plugins live for the process's lifetime.
    std::mem::forget(library);
    Ok(plugin)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn a_missing_plugin_directory_yields_no_plugins() {
    let plugins = load_external(path::Path::new("/nonexistent/plugins/dir"));
    assert!(plugins.is_empty());
  }

  #[test]
  fn non_library_files_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("readme.txt"), b"not a plugin").unwrap();
    assert!(load_external(dir.path()).is_empty());
  }
}

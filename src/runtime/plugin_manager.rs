// src/runtime/plugin_manager.rs
//! Registry of plugins keyed by name
//!
//! Lifecycle per name:
//!
//! ```text
//! unloaded ──load──▶ loaded ──start──▶ running
//!     ▲                │  ▲               │
//!     └────unload──────┘  └─────stop──────┘
//! ```
//!
//! The map sits behind a read/write lock. Only `load` and `unload` take it
//! for writing; process I/O is serialized per plugin by the plugin itself.

use crate::observability::metrics::{Counter, MetricsSink};
use crate::runtime::plugin::{Document, Plugin, PluginInfo};
use crate::utils::errors::{PlatformError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Plugin registry for one agent
pub struct PluginManager {
    plugins: RwLock<HashMap<String, Arc<Plugin>>>,
    data_dir: PathBuf,
    metrics: Arc<dyn MetricsSink>,
}

impl PluginManager {
    pub fn new(data_dir: impl Into<PathBuf>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            plugins: RwLock::new(HashMap::new()),
            data_dir: data_dir.into(),
            metrics,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Register a plugin in the `loaded` state
    pub async fn load(&self, name: &str) -> Result<()> {
        let mut plugins = self.plugins.write().await;

        if plugins.contains_key(name) {
            return Err(PlatformError::PluginAlreadyLoaded(name.to_string()));
        }

        plugins.insert(name.to_string(), Arc::new(Plugin::new(name, &self.data_dir)));
        debug!("Plugin {} loaded", name);
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        let plugin = self.get(name).await?;
        plugin.start().await?;
        self.metrics.incr(Counter::PluginsStarted);
        Ok(())
    }

    /// Stop a plugin; a stopped plugin is left as is
    pub async fn stop(&self, name: &str) -> Result<()> {
        let plugin = self.get(name).await?;
        self.stop_plugin(&plugin).await
    }

    /// Stop the plugin, then drop it from the registry
    pub async fn unload(&self, name: &str) -> Result<()> {
        let mut plugins = self.plugins.write().await;

        let plugin = plugins
            .get(name)
            .cloned()
            .ok_or_else(|| PlatformError::PluginNotLoaded(name.to_string()))?;

        self.stop_plugin(&plugin).await?;
        plugins.remove(name);

        info!("Plugin {} unloaded", name);
        Ok(())
    }

    pub async fn send_config(&self, name: &str, config: Document) -> Result<()> {
        let plugin = self.get(name).await?;
        plugin.send_config(config).await
    }

    /// Read the next message a plugin wrote to its stdout
    pub async fn read_data(&self, name: &str) -> Result<Document> {
        let plugin = self.get(name).await?;
        self.read_from(&plugin).await
    }

    /// Read from one specific plugin instance
    ///
    /// A plugin whose output channel closed is stopped, so it is no longer
    /// reported as enabled and can be started again.
    pub async fn read_from(&self, plugin: &Plugin) -> Result<Document> {
        match plugin.read_data().await {
            Ok(message) => {
                self.metrics.incr(Counter::PluginMessages);
                Ok(message)
            }
            Err(e @ PlatformError::PluginChannelClosed(_)) => {
                debug!("Plugin {} closed its output, stopping it", plugin.name());
                if let Err(stop_err) = self.stop_plugin(plugin).await {
                    warn!("Failed to stop plugin {}: {}", plugin.name(), stop_err);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Handle of a registered plugin
    pub async fn plugin(&self, name: &str) -> Result<Arc<Plugin>> {
        self.get(name).await
    }

    pub async fn info(&self, name: &str) -> Result<PluginInfo> {
        Ok(self.get(name).await?.info())
    }

    /// Descriptors of every registered plugin, in no particular order
    pub async fn list(&self) -> Vec<PluginInfo> {
        self.plugins
            .read()
            .await
            .values()
            .map(|plugin| plugin.info())
            .collect()
    }

    /// Stop every running plugin, keeping them registered
    pub async fn stop_all(&self) {
        let plugins: Vec<Arc<Plugin>> = self.plugins.read().await.values().cloned().collect();

        for plugin in plugins {
            if let Err(e) = self.stop_plugin(&plugin).await {
                warn!("Failed to stop plugin {}: {}", plugin.name(), e);
            }
        }
    }

    async fn get(&self, name: &str) -> Result<Arc<Plugin>> {
        self.plugins
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| PlatformError::PluginNotLoaded(name.to_string()))
    }

    async fn stop_plugin(&self, plugin: &Plugin) -> Result<()> {
        let was_running = plugin.is_running();
        plugin.stop().await?;
        if was_running {
            self.metrics.incr(Counter::PluginsStopped);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::AtomicMetrics;
    use std::collections::HashSet;
    use std::os::unix::fs::PermissionsExt;

    /// Plugin that echoes every line it reads back to stdout
    const ECHO_PLUGIN: &str = "#!/bin/sh\nwhile IFS= read -r line; do\n  printf '%s\\n' \"$line\"\ndone\n";

    fn install_script(data_dir: &Path, name: &str, body: &str) {
        let dir = data_dir.join("plugins").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn manager(data_dir: &Path) -> (PluginManager, Arc<AtomicMetrics>) {
        let metrics = Arc::new(AtomicMetrics::new());
        (PluginManager::new(data_dir, metrics.clone()), metrics)
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        install_script(dir.path(), "p", ECHO_PLUGIN);
        let (manager, metrics) = manager(dir.path());

        manager.load("p").await.unwrap();
        assert!(!manager.info("p").await.unwrap().enabled);

        manager.start("p").await.unwrap();
        assert!(manager.info("p").await.unwrap().enabled);

        manager.stop("p").await.unwrap();
        assert!(!manager.info("p").await.unwrap().enabled);

        manager.unload("p").await.unwrap();
        assert!(manager.list().await.is_empty());

        assert_eq!(metrics.get(Counter::PluginsStarted), 1);
        assert_eq!(metrics.get(Counter::PluginsStopped), 1);
    }

    #[tokio::test]
    async fn test_start_before_load() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());

        let err = manager.start("p").await.unwrap_err();
        assert!(matches!(err, PlatformError::PluginNotLoaded(_)));
        assert!(matches!(
            manager.stop("p").await.unwrap_err(),
            PlatformError::PluginNotLoaded(_)
        ));
        assert!(matches!(
            manager.unload("p").await.unwrap_err(),
            PlatformError::PluginNotLoaded(_)
        ));
    }

    #[tokio::test]
    async fn test_double_load() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());

        manager.load("p").await.unwrap();
        let err = manager.load("p").await.unwrap_err();
        assert!(matches!(err, PlatformError::PluginAlreadyLoaded(_)));
        assert_eq!(manager.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        install_script(dir.path(), "p", ECHO_PLUGIN);
        let (manager, metrics) = manager(dir.path());

        manager.load("p").await.unwrap();
        manager.start("p").await.unwrap();

        manager.stop("p").await.unwrap();
        manager.stop("p").await.unwrap();

        // never started at all
        manager.load("q").await.unwrap();
        manager.stop("q").await.unwrap();
        manager.stop("q").await.unwrap();

        assert_eq!(metrics.get(Counter::PluginsStopped), 1);
    }

    #[tokio::test]
    async fn test_list_two_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());

        manager.load("a").await.unwrap();
        manager.load("b").await.unwrap();

        let names: Vec<String> = manager.list().await.into_iter().map(|p| p.name).collect();
        assert_eq!(names.len(), 2);
        let unique: HashSet<&str> = names.iter().map(String::as_str).collect();
        assert_eq!(unique, HashSet::from(["a", "b"]));
    }

    #[tokio::test]
    async fn test_config_round_trip_through_plugin() {
        let dir = tempfile::tempdir().unwrap();
        install_script(dir.path(), "echo", ECHO_PLUGIN);
        let (manager, metrics) = manager(dir.path());

        manager.load("echo").await.unwrap();
        manager.start("echo").await.unwrap();

        let mut config = Document::new();
        config.insert("interval".into(), serde_json::json!(60));
        manager.send_config("echo", config).await.unwrap();

        let message = manager.read_data("echo").await.unwrap();
        assert_eq!(message["type"], "config");
        assert_eq!(message["data"]["interval"], 60);
        assert_eq!(metrics.get(Counter::PluginMessages), 1);

        manager.unload("echo").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_config_when_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path());

        manager.load("p").await.unwrap();
        let err = manager.send_config("p", Document::new()).await.unwrap_err();
        assert!(matches!(err, PlatformError::PluginNotRunning(_)));
    }

    #[tokio::test]
    async fn test_read_data_malformed_and_closed() {
        let dir = tempfile::tempdir().unwrap();
        install_script(dir.path(), "noisy", "#!/bin/sh\necho 'not json'\n");
        let (manager, _) = manager(dir.path());

        manager.load("noisy").await.unwrap();
        manager.start("noisy").await.unwrap();

        let err = manager.read_data("noisy").await.unwrap_err();
        assert!(matches!(err, PlatformError::PluginProtocol { .. }));

        let err = manager.read_data("noisy").await.unwrap_err();
        assert!(matches!(err, PlatformError::PluginChannelClosed(_)));

        manager.unload("noisy").await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice() {
        let dir = tempfile::tempdir().unwrap();
        install_script(dir.path(), "p", ECHO_PLUGIN);
        let (manager, _) = manager(dir.path());

        manager.load("p").await.unwrap();
        manager.start("p").await.unwrap();
        let err = manager.start("p").await.unwrap_err();
        assert!(matches!(err, PlatformError::PluginAlreadyRunning(_)));

        manager.stop_all().await;
        assert!(!manager.info("p").await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_list_while_reader_blocked() {
        let dir = tempfile::tempdir().unwrap();
        install_script(dir.path(), "p", ECHO_PLUGIN);
        let (manager, _) = manager(dir.path());
        let manager = Arc::new(manager);

        manager.load("p").await.unwrap();
        manager.start("p").await.unwrap();

        let reader = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.read_data("p").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // listing does not wait on the blocked reader
        let listed = tokio::time::timeout(std::time::Duration::from_secs(1), manager.list())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        // stopping releases the reader with a closed channel
        manager.stop("p").await.unwrap();
        let result = reader.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_stop_with_background_descendant() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let script = format!(
            "#!/bin/sh\n(sleep 2; touch {}) &\nwhile read line; do echo \"$line\"; done\n",
            marker.display()
        );
        install_script(dir.path(), "p", &script);
        let (manager, _) = manager(dir.path());
        let manager = Arc::new(manager);

        manager.load("p").await.unwrap();
        manager.start("p").await.unwrap();

        let reader = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.read_data("p").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        tokio::time::timeout(std::time::Duration::from_secs(10), manager.stop("p"))
            .await
            .unwrap()
            .unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PlatformError::PluginChannelClosed(_))));

        // registry stays usable
        tokio::time::timeout(std::time::Duration::from_secs(5), manager.unload("p"))
            .await
            .unwrap()
            .unwrap();
        assert!(manager.list().await.is_empty());

        // the background child went down with the group
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_read_from_replaced_instance() {
        let dir = tempfile::tempdir().unwrap();
        install_script(dir.path(), "echo", ECHO_PLUGIN);
        let (manager, _) = manager(dir.path());

        manager.load("echo").await.unwrap();
        manager.start("echo").await.unwrap();
        let old = manager.plugin("echo").await.unwrap();

        manager.unload("echo").await.unwrap();
        manager.load("echo").await.unwrap();
        manager.start("echo").await.unwrap();

        // a reader bound to the old instance does not reach the new process
        let err = tokio::time::timeout(std::time::Duration::from_secs(1), manager.read_from(&old))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, PlatformError::PluginNotRunning(_)));

        let mut config = Document::new();
        config.insert("k".into(), serde_json::json!("v"));
        manager.send_config("echo", config).await.unwrap();
        let message = manager.read_data("echo").await.unwrap();
        assert_eq!(message["data"]["k"], "v");

        manager.unload("echo").await.unwrap();
    }

    #[tokio::test]
    async fn test_exited_plugin_is_not_enabled() {
        let dir = tempfile::tempdir().unwrap();
        install_script(dir.path(), "p", "#!/bin/sh\nexit 1\n");
        let (manager, metrics) = manager(dir.path());

        manager.load("p").await.unwrap();
        manager.start("p").await.unwrap();

        let err = manager.read_data("p").await.unwrap_err();
        assert!(matches!(err, PlatformError::PluginChannelClosed(_)));
        assert!(!manager.info("p").await.unwrap().enabled);
        assert_eq!(metrics.get(Counter::PluginsStopped), 1);

        // can be started again
        manager.start("p").await.unwrap();
        manager.unload("p").await.unwrap();
    }
}

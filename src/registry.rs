//! Registry of element factories.
//!
//! Element types are registered under a factory name and instantiated by
//! name with [`Registry::make`]. Factories are usually grouped in a
//! [`Plugin`]. The registry is an explicit handle; [`init`] additionally
//! installs a process-wide one holding the built-in elements.
//!
//! # Example
//!
//! ```rust
//! use sluice::elements::FakeSink;
//! use sluice::elements::base::SinkAdapter;
//! use sluice::registry::Registry;
//!
//! let registry = Registry::with_builtins();
//! let sink = registry.make("fakesink", Some("out")).unwrap();
//! assert_eq!(sink.factory_name(), Some("fakesink"));
//! assert!(sink.imp_as::<SinkAdapter<FakeSink>>().is_some());
//! ```

use crate::element::Element;
use crate::elements::{FakeSink, Identity, Queue, Tee, TestSrc};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

/// Preference among factories offering the same kind of element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Rank {
    /// Never picked automatically.
    #[default]
    None,
    /// Picked only when nothing better exists.
    Marginal,
    /// Fallback choice.
    Secondary,
    /// Preferred choice.
    Primary,
}

type Constructor = dyn Fn(&str) -> Element + Send + Sync;

/// Creates elements of one type.
pub struct ElementFactory {
    name: String,
    description: String,
    klass: String,
    rank: Rank,
    plugin: Option<String>,
    constructor: Box<Constructor>,
    instances: AtomicU32,
}

impl ElementFactory {
    /// Create a factory that builds elements with `constructor`, which
    /// receives the instance name.
    pub fn new<F>(name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&str) -> Element + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            klass: String::new(),
            rank: Rank::None,
            plugin: None,
            constructor: Box::new(constructor),
            instances: AtomicU32::new(0),
        }
    }

    /// Set the human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the classification, e.g. `"Source/Test"`.
    pub fn with_klass(mut self, klass: impl Into<String>) -> Self {
        self.klass = klass.into();
        self
    }

    /// Set the rank.
    pub fn with_rank(mut self, rank: Rank) -> Self {
        self.rank = rank;
        self
    }

    /// Factory name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Classification.
    pub fn klass(&self) -> &str {
        &self.klass
    }

    /// Rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Name of the plugin the factory came from.
    pub fn plugin_name(&self) -> Option<&str> {
        self.plugin.as_deref()
    }

    /// Build an element. Without a name one is generated from the factory
    /// name and a counter (`queue0`, `queue1`, ...).
    pub fn create(&self, name: Option<&str>) -> Element {
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("{}{}", self.name, self.instances.fetch_add(1, Ordering::Relaxed)),
        };
        let element = (self.constructor)(&name);
        element.set_factory_name(&self.name);
        tracing::trace!("created {} from factory {}", element.name(), self.name);
        element
    }
}

impl fmt::Debug for ElementFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementFactory")
            .field("name", &self.name)
            .field("klass", &self.klass)
            .field("rank", &self.rank)
            .field("plugin", &self.plugin)
            .finish()
    }
}

/// A named group of factories.
#[derive(Debug)]
pub struct Plugin {
    name: String,
    description: String,
    version: String,
    factories: Vec<ElementFactory>,
}

impl Plugin {
    /// Create an empty plugin.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            factories: Vec::new(),
        }
    }

    /// Set the version string.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Add a factory to the plugin.
    pub fn with_factory(mut self, factory: ElementFactory) -> Self {
        self.factories.push(factory);
        self
    }

    /// Plugin name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Version string.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Names of the factories the plugin provides.
    pub fn factory_names(&self) -> Vec<&str> {
        self.factories.iter().map(ElementFactory::name).collect()
    }
}

/// Information kept about a registered plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    /// Plugin name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Version string.
    pub version: String,
    /// Factories it registered.
    pub factories: Vec<String>,
}

/// Registry for element factories and the plugins providing them.
#[derive(Default)]
pub struct Registry {
    factories: RwLock<HashMap<String, Arc<ElementFactory>>>,
    plugins: RwLock<HashMap<String, PluginInfo>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in elements.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        if let Err(err) = registry.register_plugin(builtins()) {
            tracing::error!("cannot register built-in elements: {err}");
        }
        registry
    }

    /// Register a factory. Fails when the name is taken.
    pub fn register(&self, factory: ElementFactory) -> Result<()> {
        let mut factories = self.factories.write().unwrap();
        if factories.contains_key(factory.name()) {
            return Err(Error::DuplicateName(factory.name().to_string()));
        }
        tracing::debug!("registered factory {}", factory.name());
        factories.insert(factory.name().to_string(), Arc::new(factory));
        Ok(())
    }

    /// Register every factory of `plugin`. Nothing is registered when
    /// the plugin or one of its factory names is already known.
    pub fn register_plugin(&self, plugin: Plugin) -> Result<()> {
        let mut plugins = self.plugins.write().unwrap();
        let mut factories = self.factories.write().unwrap();
        if plugins.contains_key(plugin.name()) {
            return Err(Error::DuplicateName(plugin.name().to_string()));
        }
        if let Some(taken) = plugin
            .factories
            .iter()
            .find(|f| factories.contains_key(f.name()))
        {
            return Err(Error::DuplicateName(taken.name().to_string()));
        }

        let info = PluginInfo {
            name: plugin.name.clone(),
            description: plugin.description.clone(),
            version: plugin.version.clone(),
            factories: plugin.factory_names().into_iter().map(String::from).collect(),
        };
        for mut factory in plugin.factories {
            factory.plugin = Some(info.name.clone());
            factories.insert(factory.name().to_string(), Arc::new(factory));
        }
        tracing::debug!("registered plugin {} with {} factories", info.name, info.factories.len());
        plugins.insert(info.name.clone(), info);
        Ok(())
    }

    /// Look up a factory.
    pub fn find(&self, factory: &str) -> Option<Arc<ElementFactory>> {
        self.factories.read().unwrap().get(factory).cloned()
    }

    /// Create an element from the factory named `factory`.
    pub fn make(&self, factory: &str, name: Option<&str>) -> Result<Element> {
        let factory = self
            .find(factory)
            .ok_or_else(|| Error::NoSuchFactory(factory.to_string()))?;
        Ok(factory.create(name))
    }

    /// All factories, best rank first, then by name.
    pub fn factories(&self) -> Vec<Arc<ElementFactory>> {
        let mut all: Vec<_> = self.factories.read().unwrap().values().cloned().collect();
        all.sort_by(|a, b| b.rank().cmp(&a.rank()).then_with(|| a.name().cmp(b.name())));
        all
    }

    /// Information about a registered plugin.
    pub fn plugin(&self, name: &str) -> Option<PluginInfo> {
        self.plugins.read().unwrap().get(name).cloned()
    }

    /// Names of all registered plugins.
    pub fn plugins(&self) -> Vec<String> {
        let mut names: Vec<_> = self.plugins.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let factories = self.factories.read().unwrap();
        let plugins = self.plugins.read().unwrap();
        f.debug_struct("Registry")
            .field("plugins", &plugins.len())
            .field("factories", &factories.len())
            .finish()
    }
}

fn builtins() -> Plugin {
    Plugin::new("coreelements", "Built-in elements")
        .with_factory(
            ElementFactory::new("testsrc", |name| TestSrc::new().build(name))
                .with_description("Produces test pattern buffers")
                .with_klass("Source/Test")
                .with_rank(Rank::None),
        )
        .with_factory(
            ElementFactory::new("identity", |name| Identity::new().build(name))
                .with_description("Passes data through unchanged")
                .with_klass("Generic")
                .with_rank(Rank::None),
        )
        .with_factory(
            ElementFactory::new("fakesink", |name| FakeSink::new().build(name))
                .with_description("Discards all data")
                .with_klass("Sink")
                .with_rank(Rank::None),
        )
        .with_factory(
            ElementFactory::new("queue", |name| Queue::new().build(name))
                .with_description("Buffers data across a thread boundary")
                .with_klass("Generic")
                .with_rank(Rank::None),
        )
        .with_factory(
            ElementFactory::new("tee", |name| Tee::new().build(name))
                .with_description("Sends data to several branches")
                .with_klass("Generic")
                .with_rank(Rank::None),
        )
}

// ============================================================================
// Process-wide registry
// ============================================================================

static GLOBAL: RwLock<Option<Arc<Registry>>> = RwLock::new(None);

/// Install the process-wide registry with the built-in elements and
/// return it. Calling it again returns the installed registry.
pub fn init() -> Arc<Registry> {
    let mut global = GLOBAL.write().unwrap();
    match &*global {
        Some(registry) => Arc::clone(registry),
        None => {
            let registry = Arc::new(Registry::with_builtins());
            *global = Some(Arc::clone(&registry));
            tracing::debug!("process registry initialized");
            registry
        }
    }
}

/// The process-wide registry, if [`init`] was called.
pub fn get() -> Option<Arc<Registry>> {
    GLOBAL.read().unwrap().clone()
}

/// Drop the process-wide registry. Handles already obtained stay valid.
pub fn deinit() {
    GLOBAL.write().unwrap().take();
    tracing::debug!("process registry released");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::base::SourceAdapter;

    #[test]
    fn test_builtins_registered() {
        let registry = Registry::with_builtins();
        let names: Vec<String> = registry
            .factories()
            .iter()
            .map(|f| f.name().to_string())
            .collect();
        assert_eq!(names, ["fakesink", "identity", "queue", "tee", "testsrc"]);
        assert_eq!(registry.plugins(), ["coreelements"]);
        assert_eq!(
            registry.find("queue").unwrap().plugin_name(),
            Some("coreelements")
        );
    }

    #[test]
    fn test_make_named_and_generated() {
        let registry = Registry::with_builtins();
        let a = registry.make("identity", None).unwrap();
        let b = registry.make("identity", None).unwrap();
        let c = registry.make("identity", Some("probe")).unwrap();
        assert_eq!((a.name(), b.name(), c.name()), ("identity0", "identity1", "probe"));
        assert_eq!(c.factory_name(), Some("identity"));
    }

    #[test]
    fn test_make_unknown_factory() {
        let registry = Registry::new();
        assert!(matches!(
            registry.make("nope", None),
            Err(Error::NoSuchFactory(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_register_duplicates() {
        let registry = Registry::with_builtins();
        let dup = ElementFactory::new("tee", |name| Tee::new().build(name));
        assert!(matches!(registry.register(dup), Err(Error::DuplicateName(_))));

        let plugin = Plugin::new("extra", "More elements")
            .with_factory(ElementFactory::new("ok", |name| Tee::new().build(name)))
            .with_factory(ElementFactory::new("queue", |name| Queue::new().build(name)));
        assert!(registry.register_plugin(plugin).is_err());
        assert!(registry.find("ok").is_none());
    }

    #[test]
    fn test_rank_ordering() {
        let registry = Registry::new();
        registry
            .register(ElementFactory::new("b", |name| Tee::new().build(name)))
            .unwrap();
        registry
            .register(
                ElementFactory::new("a", |name| Tee::new().build(name)).with_rank(Rank::Primary),
            )
            .unwrap();
        let names: Vec<_> = registry.factories().iter().map(|f| f.name().to_string()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_factory_element_configured_by_downcast() {
        let registry = Registry::with_builtins();
        let src = registry.make("testsrc", Some("src")).unwrap();
        let adapter = src.imp_as::<SourceAdapter<TestSrc>>().unwrap();
        adapter.source().set_num_buffers(Some(2));
        assert_eq!(adapter.source().buffers_produced(), 0);
    }

    #[test]
    fn test_global_registry() {
        let first = init();
        let again = init();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(get().is_some_and(|r| r.find("tee").is_some()));
        deinit();
        assert!(get().is_none());
        assert!(first.find("tee").is_some());
    }
}

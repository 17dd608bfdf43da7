use crate::TargetMapper;
use config::ConfigDocument;
use streams::{Error, Result};
use std::collections::BTreeMap;

type Factory<C> =
    Box<dyn Fn(&ConfigDocument, &C) -> Result<Box<dyn TargetMapper>> + Send + Sync>;

/// Compile-time mapper registry. Each sink registers a factory under a
/// qualified key (`sinks.object-store`); configuration may name a mapper
/// either by its full key or by an unqualified name resolved through the
/// ordered prefix list.
///
/// `C` is the context handed to factories alongside the parsed config —
/// in practice the sink client registry owned by the scheduler.
pub struct MapperRegistry<C> {
    factories: BTreeMap<String, Factory<C>>,
    prefixes: Vec<String>,
}

impl<C> Default for MapperRegistry<C> {
    fn default() -> Self {
        Self {
            factories: BTreeMap::new(),
            prefixes: Vec::new(),
        }
    }
}

impl<C> MapperRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a prefix searched, in registration order, for unqualified
    /// names.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefixes.push(prefix.to_string());
        self
    }

    pub fn register<F>(&mut self, key: &str, factory: F)
    where
        F: Fn(&ConfigDocument, &C) -> Result<Box<dyn TargetMapper>> + Send + Sync + 'static,
    {
        self.factories.insert(key.to_string(), Box::new(factory));
    }

    /// Resolve `name` and instantiate the mapper with `config`.
    pub fn instantiate(
        &self,
        name: &str,
        config: &ConfigDocument,
        context: &C,
    ) -> Result<Box<dyn TargetMapper>> {
        let factory = if name.contains('.') {
            self.factories.get(name)
        } else {
            self.prefixes
                .iter()
                .find_map(|prefix| self.factories.get(&format!("{prefix}.{name}")))
        };

        match factory {
            Some(factory) => factory(config, context),
            None => Err(Error::Config(format!(
                "unknown target mapper '{name}' (registered: {})",
                self.factories
                    .keys()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MapperCommon;
    use streams::ChangeRecord;
    use tokio_util::sync::CancellationToken;

    struct NullMapper {
        common: MapperCommon,
    }

    #[async_trait::async_trait]
    impl TargetMapper for NullMapper {
        fn name(&self) -> &'static str {
            "null"
        }
        fn common(&self) -> &MapperCommon {
            &self.common
        }
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }
        async fn handle_records(
            &self,
            _: &[ChangeRecord],
            _: &CancellationToken,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> MapperRegistry<()> {
        let mut registry = MapperRegistry::new().with_prefix("sinks");
        registry.register("sinks.null", |config, _| {
            Ok(Box::new(NullMapper {
                common: MapperCommon::from_config(config)?,
            }) as Box<dyn TargetMapper>)
        });
        registry
    }

    #[test]
    fn resolves_qualified_and_unqualified_names() {
        let registry = registry();
        let config = ConfigDocument::from_env(Default::default());

        assert_eq!(
            registry.instantiate("sinks.null", &config, &()).unwrap().name(),
            "null"
        );
        assert_eq!(
            registry.instantiate("null", &config, &()).unwrap().name(),
            "null"
        );
    }

    #[test]
    fn unknown_names_are_config_errors() {
        let registry = registry();
        let config = ConfigDocument::from_env(Default::default());

        for name in ["sinks.queue", "queue", "other.null"] {
            let err = registry.instantiate(name, &config, &()).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{name}: {err}");
        }
    }
}

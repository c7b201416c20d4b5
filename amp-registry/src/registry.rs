//! Versioned capability registry.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use amp_primitives::semver::Version;
use amp_primitives::{Capability, CapabilityId, parse_version};
use serde_json::Value;
use tracing::{debug, warn};

use crate::handler::CapabilityHandler;
use crate::negotiate::{VersionConstraint, negotiate};
use crate::schema::CompiledSchema;
use crate::{RegistryError, RegistryResult};

type Versions = BTreeMap<Version, Arc<Registration>>;
type Table = BTreeMap<String, Versions>;

/// One registered (capability, version) with its handler.
///
/// Resolution hands out `Arc<Registration>`, so an invocation keeps its
/// handler alive after the entry is unregistered.
pub struct Registration {
    capability: Arc<Capability>,
    handler: Arc<dyn CapabilityHandler>,
    input: CompiledSchema,
    output: CompiledSchema,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("capability", &self.capability.id())
            .field("version", &self.capability.version())
            .finish_non_exhaustive()
    }
}

impl Registration {
    /// Capability descriptor.
    #[must_use]
    pub fn capability(&self) -> &Arc<Capability> {
        &self.capability
    }

    /// Bound handler.
    #[must_use]
    pub fn handler(&self) -> &Arc<dyn CapabilityHandler> {
        &self.handler
    }

    /// Checks request parameters against the input schema and constraints.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidParameters`] with per-field detail,
    /// [`RegistryError::InputTooLong`], or [`RegistryError::UnsupportedLanguage`].
    pub fn validate_input(&self, parameters: &Value) -> RegistryResult<()> {
        let violations = self.input.violations("parameters", parameters);
        if !violations.is_empty() {
            return Err(RegistryError::InvalidParameters { violations });
        }

        let constraints = self.capability.constraints();
        if let Some(limit) = constraints.max_input_length {
            let length = parameters.to_string().len();
            if length > limit {
                return Err(RegistryError::InputTooLong { length, limit });
            }
        }

        if !constraints.supported_languages.is_empty() {
            if let Some(language) = parameters.get("language").and_then(Value::as_str) {
                let wanted = language.to_ascii_lowercase();
                if !constraints.supported_languages.contains(&wanted) {
                    return Err(RegistryError::UnsupportedLanguage {
                        language: language.to_owned(),
                        supported: constraints.supported_languages.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Checks a handler result against the output schema.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidOutput`] on mismatch.
    pub fn validate_output(&self, result: &Value) -> RegistryResult<()> {
        let violations = self.output.violations("result", result);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::InvalidOutput {
                capability: self.capability.id().to_string(),
                violations,
            })
        }
    }
}

/// Registry holding versioned capabilities and their handlers.
///
/// Readers clone an `Arc` of the current table and never wait on writers
/// beyond the pointer swap; writers are serialised and copy the table.
#[derive(Default)]
pub struct CapabilityRegistry {
    table: RwLock<Arc<Table>>,
    writer: Mutex<()>,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("registered", &self.ids())
            .finish()
    }
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Arc<Table> {
        Arc::clone(&self.table.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn update<R>(&self, apply: impl FnOnce(&mut Table) -> R) -> R {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.current()).clone();
        let outcome = apply(&mut next);
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        outcome
    }

    /// Registers a handler for `capability`, replacing any entry with the same
    /// (id, version). Returns the replaced descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidSchema`] if either schema does not compile.
    pub fn register<H>(&self, capability: Capability, handler: H) -> RegistryResult<Option<Arc<Capability>>>
    where
        H: CapabilityHandler + 'static,
    {
        self.register_shared(capability, Arc::new(handler))
    }

    /// Same as [`CapabilityRegistry::register`] for an already shared handler.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidSchema`] if either schema does not compile.
    pub fn register_shared(
        &self,
        capability: Capability,
        handler: Arc<dyn CapabilityHandler>,
    ) -> RegistryResult<Option<Arc<Capability>>> {
        let compile = |schema: &Value| {
            CompiledSchema::compile(schema).map_err(|reason| RegistryError::InvalidSchema {
                capability: capability.id().to_string(),
                reason,
            })
        };
        let input = compile(capability.input_schema())?;
        let output = compile(capability.output_schema())?;

        let id = capability.id().to_string();
        let version = capability.version().clone();
        let registration = Arc::new(Registration {
            capability: Arc::new(capability),
            handler,
            input,
            output,
        });

        let previous = self.update(|table| {
            table
                .entry(id.clone())
                .or_default()
                .insert(version.clone(), registration)
        });

        if previous.is_some() {
            warn!(capability = %id, %version, "capability re-registered; previous handler replaced");
        } else {
            debug!(capability = %id, %version, "capability registered");
        }
        Ok(previous.map(|registration| Arc::clone(&registration.capability)))
    }

    /// Removes (id, version) for future lookups. In-flight invocations keep
    /// their handler.
    pub fn unregister(&self, id: &CapabilityId, version: &Version) -> Option<Arc<Capability>> {
        let removed = self.update(|table| {
            let versions = table.get_mut(id.as_str())?;
            let removed = versions.remove(version);
            if versions.is_empty() {
                table.remove(id.as_str());
            }
            removed
        });
        if removed.is_some() {
            debug!(capability = %id, %version, "capability unregistered");
        }
        removed.map(|registration| Arc::clone(&registration.capability))
    }

    /// Resolves a request to a registration.
    ///
    /// `constraint` defaults to any version. `preferred` is honoured when it is
    /// registered and satisfies the constraint.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::CapabilityNotFound`] (listing available ids),
    /// [`RegistryError::NoMatchingVersion`], or
    /// [`RegistryError::InvalidConstraint`] for unparsable version strings.
    pub fn resolve(
        &self,
        id: &str,
        constraint: Option<&str>,
        preferred: Option<&str>,
    ) -> RegistryResult<Arc<Registration>> {
        let constraint = constraint.map_or_else(|| Ok(VersionConstraint::any()), VersionConstraint::parse)?;
        let preferred = preferred
            .map(|raw| {
                parse_version(raw).map_err(|err| RegistryError::InvalidConstraint {
                    constraint: raw.to_owned(),
                    reason: err.to_string(),
                })
            })
            .transpose()?;

        let table = self.current();
        let Some(versions) = table.get(id) else {
            return Err(RegistryError::CapabilityNotFound {
                id: id.to_owned(),
                available: table.keys().cloned().collect(),
            });
        };

        let chosen = negotiate(versions.keys(), &constraint, preferred.as_ref()).ok_or_else(|| {
            RegistryError::NoMatchingVersion {
                id: id.to_owned(),
                constraint: constraint.to_string(),
                available: versions.keys().map(ToString::to_string).collect(),
            }
        })?;
        Ok(Arc::clone(&versions[chosen]))
    }

    /// Registered capability ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.current().keys().cloned().collect()
    }

    /// Registered versions of `id`, ascending.
    #[must_use]
    pub fn versions(&self, id: &str) -> Vec<Version> {
        self.current()
            .get(id)
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every registered descriptor.
    #[must_use]
    pub fn capabilities(&self) -> Vec<Arc<Capability>> {
        self.current()
            .values()
            .flat_map(|versions| versions.values())
            .map(|registration| Arc::clone(&registration.capability))
            .collect()
    }

    /// Number of registered (id, version) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.current().values().map(BTreeMap::len).sum()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HandlerError, Invocation};
    use amp_primitives::CapabilityConstraints;
    use serde_json::json;

    fn capability(id: &str, version: &str) -> Capability {
        Capability::builder(CapabilityId::new(id).unwrap())
            .version(version)
            .unwrap()
            .build()
            .unwrap()
    }

    async fn echo(invocation: Invocation) -> Result<Value, HandlerError> {
        Ok(invocation.parameters)
    }

    fn tag(version: &'static str) -> impl CapabilityHandler {
        move |_: Invocation| async move { Ok::<_, HandlerError>(json!(version)) }
    }

    #[test]
    fn negotiates_across_registered_versions() {
        let registry = CapabilityRegistry::new();
        for version in ["1.0.0", "1.2.0", "2.0.0"] {
            registry
                .register(capability("text-analysis", version), tag(version))
                .unwrap();
        }

        let resolved = registry
            .resolve("text-analysis", Some(">=1.0.0 <2.0.0"), None)
            .unwrap();
        assert_eq!(resolved.capability().version().to_string(), "1.2.0");

        let resolved = registry
            .resolve("text-analysis", Some(">=1.0.0 <2.0.0"), Some("1.2.0"))
            .unwrap();
        assert_eq!(resolved.capability().version().to_string(), "1.2.0");

        let resolved = registry.resolve("text-analysis", None, None).unwrap();
        assert_eq!(resolved.capability().version().to_string(), "2.0.0");

        let err = registry
            .resolve("text-analysis", Some(">=3.0.0"), None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::NoMatchingVersion { .. }));
    }

    #[test]
    fn unknown_capability_lists_available() {
        let registry = CapabilityRegistry::new();
        registry.register(capability("echo", "1.0.0"), echo).unwrap();
        let err = registry.resolve("translate", None, None).unwrap_err();
        match err {
            RegistryError::CapabilityNotFound { id, available } => {
                assert_eq!(id, "translate");
                assert_eq!(available, vec!["echo".to_owned()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn reregistration_overwrites() {
        let registry = CapabilityRegistry::new();
        assert!(registry.register(capability("echo", "1.0.0"), tag("old")).unwrap().is_none());
        assert!(registry.register(capability("echo", "1.0.0"), tag("new")).unwrap().is_some());
        assert_eq!(registry.len(), 1);

        let resolved = registry.resolve("echo", None, None).unwrap();
        let invocation = Invocation {
            message_id: "msg-1".into(),
            caller: None,
            capability: Arc::clone(resolved.capability()),
            parameters: Value::Null,
            context: None,
        };
        assert_eq!(resolved.handler().execute(invocation).await.unwrap(), json!("new"));
    }

    #[tokio::test]
    async fn unregister_keeps_captured_handler() {
        let registry = CapabilityRegistry::new();
        registry.register(capability("echo", "1.0.0"), echo).unwrap();
        let captured = registry.resolve("echo", None, None).unwrap();

        let id = CapabilityId::new("echo").unwrap();
        let version = Version::parse("1.0.0").unwrap();
        assert!(registry.unregister(&id, &version).is_some());
        assert!(registry.is_empty());
        assert!(registry.resolve("echo", None, None).is_err());

        let invocation = Invocation {
            message_id: "msg-2".into(),
            caller: None,
            capability: Arc::clone(captured.capability()),
            parameters: json!({"still": "alive"}),
            context: None,
        };
        let output = captured.handler().execute(invocation).await.unwrap();
        assert_eq!(output, json!({"still": "alive"}));
    }

    #[test]
    fn input_constraints() {
        let registry = CapabilityRegistry::new();
        let constraints = CapabilityConstraints {
            max_input_length: Some(40),
            supported_languages: vec!["en".into(), "fr".into()],
            ..CapabilityConstraints::default()
        };
        let capability = Capability::builder(CapabilityId::new("summarize").unwrap())
            .version("1.0.0")
            .unwrap()
            .input_schema(json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }))
            .constraints(constraints)
            .build()
            .unwrap();
        registry.register(capability, echo).unwrap();
        let resolved = registry.resolve("summarize", None, None).unwrap();

        assert!(resolved.validate_input(&json!({"text": "hi", "language": "EN"})).is_ok());
        assert!(matches!(
            resolved.validate_input(&json!({"text": 1})),
            Err(RegistryError::InvalidParameters { .. })
        ));
        assert!(matches!(
            resolved.validate_input(&json!({"text": "x".repeat(64)})),
            Err(RegistryError::InputTooLong { .. })
        ));
        assert!(matches!(
            resolved.validate_input(&json!({"text": "hi", "language": "de"})),
            Err(RegistryError::UnsupportedLanguage { .. })
        ));
    }

    #[test]
    fn output_schema_enforced() {
        let registry = CapabilityRegistry::new();
        let capability = Capability::builder(CapabilityId::new("count").unwrap())
            .version("1.0.0")
            .unwrap()
            .output_schema(json!({ "type": "integer" }))
            .build()
            .unwrap();
        registry.register(capability, echo).unwrap();
        let resolved = registry.resolve("count", None, None).unwrap();
        assert!(resolved.validate_output(&json!(3)).is_ok());
        assert!(matches!(
            resolved.validate_output(&json!("three")),
            Err(RegistryError::InvalidOutput { .. })
        ));
    }

    #[test]
    fn invalid_schema_rejected_at_registration() {
        let registry = CapabilityRegistry::new();
        let capability = Capability::builder(CapabilityId::new("broken").unwrap())
            .version("1.0.0")
            .unwrap()
            .input_schema(json!({ "type": "nonsense" }))
            .build()
            .unwrap();
        let err = registry.register(capability, echo).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSchema { .. }));
        assert!(registry.is_empty());
    }
}

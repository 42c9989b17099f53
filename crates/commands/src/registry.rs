//! Name → command resolution.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::command::Command;

/// Command resolution failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("command name is empty")]
    EmptyName,
    #[error("no command registered for '{0}'")]
    Unknown(String),
}

/// Registry mapping command names to implementations.
///
/// Resolution order:
/// 1. exact name
/// 2. category pattern: `"mail.*"` matches `"mail.send"`, longest prefix wins
/// 3. the `"*"` fallback
#[derive(Default, Clone)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the command for `name`.
    pub fn register<C>(&mut self, name: impl Into<String>, command: C)
    where
        C: Command,
    {
        self.commands.insert(name.into(), Arc::new(command));
    }

    /// Register an already shared command.
    pub fn register_shared(&mut self, name: impl Into<String>, command: Arc<dyn Command>) {
        self.commands.insert(name.into(), command);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<C>(mut self, name: impl Into<String>, command: C) -> Self
    where
        C: Command,
    {
        self.register(name, command);
        self
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Command>, ResolutionError> {
        if name.is_empty() {
            return Err(ResolutionError::EmptyName);
        }

        if let Some(command) = self.commands.get(name) {
            return Ok(command.clone());
        }

        let category = self
            .commands
            .iter()
            .filter_map(|(pattern, command)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = name.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), command))
            })
            .max_by_key(|(len, _)| *len);

        if let Some((len, command)) = category {
            debug!(command = name, category = &name[..len], "resolved by category");
            return Ok(command.clone());
        }

        let fallback = self
            .commands
            .get("*")
            .cloned()
            .ok_or_else(|| ResolutionError::Unknown(name.to_string()))?;
        debug!(command = name, "resolved by fallback");
        Ok(fallback)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl core::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("CommandRegistry").field("commands", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutcome, Invocation};
    use forgeexec_core::{CommandContext, RequestId};

    fn tagged(tag: &'static str) -> impl Command {
        move |_: &Invocation<'_>| CommandOutcome::success_with(CommandContext::new().with("tag", tag))
    }

    fn run(registry: &CommandRegistry, name: &str) -> Option<String> {
        let command = registry.resolve(name).ok()?;
        let ctx = CommandContext::new();
        let outcome = command.execute(&Invocation {
            request_id: RequestId::new(),
            command_name: name,
            business_key: None,
            retry_count: 0,
            context: &ctx,
        });
        match outcome {
            CommandOutcome::Success(Some(resp)) => resp.get_str("tag").map(str::to_string),
            _ => None,
        }
    }

    #[test]
    fn exact_match_wins() {
        let registry = CommandRegistry::new()
            .with("mail.send", tagged("exact"))
            .with("mail.*", tagged("category"))
            .with("*", tagged("fallback"));

        assert_eq!(run(&registry, "mail.send").as_deref(), Some("exact"));
        assert_eq!(run(&registry, "mail.digest").as_deref(), Some("category"));
        assert_eq!(run(&registry, "billing.close").as_deref(), Some("fallback"));
    }

    #[test]
    fn longest_category_prefix_wins() {
        let registry = CommandRegistry::new()
            .with("mail.*", tagged("mail"))
            .with("mail.bulk.*", tagged("bulk"));

        assert_eq!(run(&registry, "mail.bulk.newsletter").as_deref(), Some("bulk"));
        assert_eq!(run(&registry, "mail.single").as_deref(), Some("mail"));
        // Prefix must end on a segment boundary.
        assert!(registry.resolve("mailbox").is_err());
    }

    #[test]
    fn unknown_and_empty_names_fail() {
        let registry = CommandRegistry::new().with("known", tagged("k"));

        assert_eq!(
            registry.resolve("missing").err(),
            Some(ResolutionError::Unknown("missing".to_string()))
        );
        assert_eq!(registry.resolve("").err(), Some(ResolutionError::EmptyName));
        assert!(registry.contains("known"));
    }
}

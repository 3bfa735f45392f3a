//! Argument resolution: binds an invocation's raw input to the declared
//! parameters of its command and runs the handler.

use crate::args::{Arg, Args};
use crate::context::InvocationContext;
use crate::module::{HandlerOutput, ModuleRegistry};
use botcore_catalog::{Catalog, Command};
use botcore_ipc::{Invocation, InvocationInput};
use botcore_repo::EntityRepository;
use botcore_storage::{MessageLog, MessageRecord, SettingValue, SettingsStore};
use botcore_types::{CoreError, EntityId, EntityKey, ParamKind, ParameterDescriptor, Result};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Result of a completed invocation.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub context: InvocationContext,
    pub output: HandlerOutput,
}

pub struct Pipeline {
    catalog: Arc<Catalog>,
    settings: SettingsStore,
    repo: Arc<EntityRepository>,
    messages: MessageLog,
    modules: Arc<ModuleRegistry>,
}

impl Pipeline {
    pub fn new(
        catalog: Arc<Catalog>,
        settings: SettingsStore,
        repo: Arc<EntityRepository>,
        messages: MessageLog,
        modules: Arc<ModuleRegistry>,
    ) -> Self {
        Self {
            catalog,
            settings,
            repo,
            messages,
            modules,
        }
    }

    pub async fn run(&self, invocation: &Invocation) -> Result<Outcome> {
        let span = info_span!(
            "invocation",
            trace_id = %invocation.trace_id,
            module = %invocation.module,
            command = %invocation.command,
            chat_id = invocation.chat_id,
            actor_id = invocation.actor_id,
        );
        self.run_steps(invocation).instrument(span).await
    }

    async fn run_steps(&self, invocation: &Invocation) -> Result<Outcome> {
        // 1. catalog lookup
        let command = self
            .catalog
            .command(&invocation.module, &invocation.command)?;
        let handler = self
            .modules
            .handler(&command.module, &command.name)
            .ok_or_else(|| CoreError::not_found("Command", &command.name))?;

        // 2. raw token intake
        let tokens = intake(&invocation.input);
        debug!(tokens = ?tokens, "Token intake");

        // 3. binding
        let mut slots = bind(&command.params, &tokens)?;

        let ctx = InvocationContext::load(invocation, &self.settings, &self.messages);

        // 4. current values
        for (idx, param) in command.params.iter().enumerate() {
            if param.kind == ParamKind::CurrentLookup {
                slots[idx] = self.current_value(&ctx, param);
            }
        }

        // 5. required entities
        for (idx, param) in command.params.iter().enumerate() {
            if param.kind == ParamKind::RequiredLookup {
                slots[idx] = self.required_entity(&ctx, param, &slots[idx]);
            }
        }

        // 6. context injection
        for (idx, param) in command.params.iter().enumerate() {
            if let ParamKind::Context(value) = param.kind {
                slots[idx] = ctx.value(value);
            }
        }

        let args = Args::new(
            command
                .params
                .iter()
                .map(|p| p.name.clone())
                .zip(slots)
                .collect(),
        );
        self.log_message(invocation, &command);

        // 7. invoke
        info!(handler = %command.handler_ref, args = args.len(), "Invoking handler");
        let output = handler.handle(&ctx, args).await.map_err(|e| match e.downcast::<CoreError>() {
            Ok(core) => core,
            Err(other) => CoreError::Handler(format!("{:#}", other)),
        })?;

        // 8. post-invocation memory
        if command.tag().remembers_result() {
            self.remember(&ctx, &output);
        }

        // 9. the context leaves with the outcome; nothing is kept here
        Ok(Outcome {
            context: ctx,
            output,
        })
    }

    fn current_value(&self, ctx: &InvocationContext, param: &ParameterDescriptor) -> Arg {
        let scope = ctx.scope();
        let Some(type_id) = param.entity_type.as_deref() else {
            return match self.settings.read(scope, param.slot()) {
                Ok(SettingValue::Set(value)) => Arg::from_raw(param, &value),
                Ok(_) => Arg::Absent,
                Err(e) => {
                    warn!(param = %param.name, "Setting read failed: {}", e);
                    Arg::Absent
                }
            };
        };

        let Some(entity_type) = self.repo.registry().find(type_id) else {
            warn!(param = %param.name, entity_type = type_id, "Unknown entity type");
            return Arg::Absent;
        };
        let id = match self.settings.read_entity(scope, entity_type) {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!(param = %param.name, "No current {} remembered", entity_type.id);
                return Arg::Absent;
            }
            Err(e) => {
                warn!(param = %param.name, "Setting read failed: {}", e);
                return Arg::Absent;
            }
        };
        match self.repo.get(&id, Some(ctx.chat_id)) {
            Ok(entity) => Arg::Entity(entity),
            Err(e) => {
                warn!(param = %param.name, entity = %id, "Current entity unavailable: {}", e);
                Arg::Absent
            }
        }
    }

    fn required_entity(&self, ctx: &InvocationContext, param: &ParameterDescriptor, bound: &Arg) -> Arg {
        let Some(type_id) = param.entity_type.as_deref() else {
            return bound.clone();
        };
        let Some(token) = bound.as_text() else {
            return Arg::Absent;
        };
        let EntityKey::Id(id) = EntityKey::parse(token) else {
            debug!(param = %param.name, token, "Non-numeric id, binding absent");
            return Arg::Absent;
        };
        match self.repo.get(&EntityId::numeric(type_id, id), Some(ctx.chat_id)) {
            Ok(entity) => Arg::Entity(entity),
            Err(e) => {
                warn!(param = %param.name, id, "Required entity unavailable: {}", e);
                Arg::Absent
            }
        }
    }

    fn remember(&self, ctx: &InvocationContext, output: &HandlerOutput) {
        let Some(entity) = output.entity() else {
            return;
        };
        let (Some(id), Some(entity_type)) = (entity.id, self.repo.registry().find(&entity.entity_type))
        else {
            warn!(entity_type = %entity.entity_type, "Result cannot be remembered");
            return;
        };
        match self.settings.write_entity(ctx.scope(), entity_type, id) {
            Ok(()) => info!(slot = %entity_type.default_slot(), id, "Remembered current entity"),
            Err(e) => warn!("Failed to remember current entity: {}", e),
        }
    }

    fn log_message(&self, invocation: &Invocation, command: &Command) {
        let Some(message) = invocation.message.as_ref() else {
            return;
        };
        let record =
            MessageRecord::from_message(message).with_command(&command.module, &command.name);
        if let Err(e) = self.messages.record(&record) {
            warn!("Failed to log command message: {}", e);
        }
    }
}

/// Raw input after intake.
#[derive(Debug, Clone, PartialEq)]
pub enum Tokens {
    /// Whitespace-split free text, bound by position.
    Positional(Vec<String>),
    /// Values keyed by parameter name, bound by name.
    Named(Vec<(String, String)>),
}

/// Free text and a single named value are split on whitespace; several
/// named values stay keyed so a missing name cannot shift the others.
pub fn intake(input: &InvocationInput) -> Tokens {
    match input {
        InvocationInput::Text(text) => Tokens::Positional(split(text)),
        InvocationInput::Named(values) if values.len() == 1 => Tokens::Positional(split(&values[0].1)),
        InvocationInput::Named(values) => Tokens::Named(values.clone()),
    }
}

fn split(text: &str) -> Vec<String> {
    text.split_whitespace().map(String::from).collect()
}

pub fn bind(params: &[ParameterDescriptor], tokens: &Tokens) -> Result<Vec<Arg>> {
    match tokens {
        Tokens::Positional(tokens) => bind_positional(params, tokens),
        Tokens::Named(values) => bind_named(params, values),
    }
}

/// Binds tokens to token-consuming parameters in order. The last such
/// parameter takes the remaining tokens joined by a space; parameters past
/// the supplied tokens bind absent. Missing required parameters fail.
pub fn bind_positional(params: &[ParameterDescriptor], tokens: &[String]) -> Result<Vec<Arg>> {
    let mut slots = vec![Arg::Absent; params.len()];
    let bindable = bindable(params);

    let mut next = 0;
    for (n, &idx) in bindable.iter().enumerate() {
        let param = &params[idx];
        if next < tokens.len() {
            let raw = if n + 1 == bindable.len() {
                let rest = tokens[next..].join(" ");
                next = tokens.len();
                rest
            } else {
                next += 1;
                tokens[next - 1].clone()
            };
            slots[idx] = bind_raw(param, raw);
        }
        check_required(param, &slots[idx], n)?;
    }

    if bindable.is_empty() && !tokens.is_empty() {
        debug!(tokens = tokens.len(), "Command takes no arguments, tokens ignored");
    }
    Ok(slots)
}

/// Binds each token-consuming parameter to the value carrying its name (or
/// its slot name); unnamed parameters bind absent. Whitespace inside a value
/// is collapsed as free text would be.
pub fn bind_named(params: &[ParameterDescriptor], values: &[(String, String)]) -> Result<Vec<Arg>> {
    let mut slots = vec![Arg::Absent; params.len()];
    for (n, &idx) in bindable(params).iter().enumerate() {
        let param = &params[idx];
        let value = values
            .iter()
            .find(|(name, _)| name == &param.name || name == param.slot())
            .map(|(_, value)| split(value).join(" "))
            .filter(|value| !value.is_empty());
        if let Some(raw) = value {
            slots[idx] = bind_raw(param, raw);
        }
        check_required(param, &slots[idx], n)?;
    }

    for (name, _) in values {
        if !params.iter().any(|p| &p.name == name || p.slot() == name) {
            debug!(name = %name, "Named value matches no parameter, ignored");
        }
    }
    Ok(slots)
}

fn bindable(params: &[ParameterDescriptor]) -> Vec<usize> {
    params
        .iter()
        .enumerate()
        .filter(|(_, p)| p.kind.binds_token())
        .map(|(idx, _)| idx)
        .collect()
}

fn bind_raw(param: &ParameterDescriptor, raw: String) -> Arg {
    match param.kind {
        // resolved to an entity in a later step
        ParamKind::RequiredLookup => Arg::Text(raw),
        _ => Arg::from_raw(param, &raw),
    }
}

fn check_required(param: &ParameterDescriptor, slot: &Arg, n: usize) -> Result<()> {
    if param.is_required() && slot.is_absent() {
        return Err(CoreError::Validation {
            name: param.slot().to_string(),
            position: n + 1,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use botcore_types::ContextParam;

    fn tokens(text: &str) -> Vec<String> {
        text.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn last_parameter_absorbs_remainder() {
        let params = vec![
            ParameterDescriptor::positional("lang"),
            ParameterDescriptor::positional("title"),
        ];
        let slots = bind_positional(&params, &tokens("EN My  long title")).expect("bind");
        assert_eq!(slots[0], Arg::Text("EN".to_string()));
        assert_eq!(slots[1], Arg::Text("My long title".to_string()));
    }

    #[test]
    fn one_token_for_many_parameters_binds_the_first() {
        let params = vec![
            ParameterDescriptor::positional("a"),
            ParameterDescriptor::positional("b"),
            ParameterDescriptor::positional("c"),
        ];
        let slots = bind_positional(&params, &tokens("only")).expect("bind");
        assert_eq!(
            slots,
            vec![Arg::Text("only".to_string()), Arg::Absent, Arg::Absent]
        );
    }

    #[test]
    fn fewer_tokens_than_parameters_leave_the_tail_absent() {
        let params = vec![
            ParameterDescriptor::positional("a"),
            ParameterDescriptor::positional("b"),
            ParameterDescriptor::positional("c"),
            ParameterDescriptor::positional("d"),
        ];
        let slots = bind_positional(&params, &tokens("x y")).expect("bind");
        assert_eq!(slots[1], Arg::Text("y".to_string()));
        assert!(slots[2].is_absent() && slots[3].is_absent());
    }

    #[test]
    fn non_bindable_parameters_are_skipped() {
        let params = vec![
            ParameterDescriptor::context(ContextParam::ChatId),
            ParameterDescriptor::positional("title"),
            ParameterDescriptor::current_entity("owner", "user", "User"),
        ];
        let slots = bind_positional(&params, &tokens("My Title")).expect("bind");
        assert!(slots[0].is_absent());
        assert_eq!(slots[1], Arg::Text("My Title".to_string()));
        assert!(slots[2].is_absent());
    }

    #[test]
    fn missing_required_parameter_fails_with_position() {
        let params = vec![
            ParameterDescriptor::required_lookup("note", "note", "Note"),
            ParameterDescriptor::required("title"),
        ];
        let err = bind_positional(&params, &tokens("12")).expect_err("title missing");
        assert_eq!(err.user_message(), "Argument title at position 2 required!");
    }

    fn named(values: &[(&str, &str)]) -> InvocationInput {
        InvocationInput::Named(
            values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn single_named_value_is_split_like_free_text() {
        let params = vec![
            ParameterDescriptor::positional("lang"),
            ParameterDescriptor::context(ContextParam::ChatId),
            ParameterDescriptor::positional("title"),
        ];
        let tokens = intake(&named(&[("title", "EN  Hello")]));
        assert_eq!(tokens, Tokens::Positional(vec!["EN".to_string(), "Hello".to_string()]));
        let slots = bind(&params, &tokens).expect("bind");
        assert_eq!(slots[0], Arg::Text("EN".to_string()));
        assert_eq!(slots[2], Arg::Text("Hello".to_string()));
    }

    #[test]
    fn named_values_bind_by_name_without_shifting() {
        let params = vec![
            ParameterDescriptor::positional("a"),
            ParameterDescriptor::positional("b"),
            ParameterDescriptor::positional("c"),
        ];
        let tokens = intake(&named(&[("c", "third"), ("a", "first")]));
        let slots = bind(&params, &tokens).expect("bind");
        assert_eq!(
            slots,
            vec![
                Arg::Text("first".to_string()),
                Arg::Absent,
                Arg::Text("third".to_string())
            ]
        );
    }

    #[test]
    fn missing_required_named_value_fails_with_position() {
        let params = vec![
            ParameterDescriptor::positional("lang"),
            ParameterDescriptor::required("title"),
        ];
        let tokens = intake(&named(&[("lang", "EN"), ("other", "x")]));
        let err = bind(&params, &tokens).expect_err("title missing");
        assert_eq!(err.user_message(), "Argument title at position 2 required!");
    }
}

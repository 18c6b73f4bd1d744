//! Tool schemas and dispatch for model-emitted function calls.
//!
//! The tool set is derived from the agent's configuration and declared to the
//! model at session start. The dispatcher interprets
//! `response.function_call_arguments.done` events: it executes side effects
//! that do not touch the human transport itself, and hands back a small list
//! of actions for the bridge to apply on its side of the wire.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bridge::CallControl;
use crate::db::CallStore;
use crate::knowledge::KnowledgeService;
use crate::realtime::{SessionHandle, ToolInvocation};
use crate::telephony::TelephonyClient;
use crate::types::{
    CallDirection, Termination, TerminationCause, ToolConfiguration, BROWSER_NAME,
};

/// Build the tool schema array for `session.update`.
pub fn agent_tools(config: &ToolConfiguration) -> Vec<Value> {
    let mut tools = Vec::new();
    if config.hang_up {
        tools.push(json!({
            "type": "function",
            "name": "hang_up",
            "description": "Hang up the call",
            "parameters": {
                "type": "object",
                "properties": {
                    "reason": {
                        "type": "string",
                        "description": "The reason for hanging up the call. `end_of_call` if the call ended naturally, `answering_machine` if the call was answered by an answering machine and you are instructed to not leave a message",
                        "enum": ["end_of_call", "answering_machine"],
                    },
                },
                "required": ["reason"],
            },
        }));
        tools.push(json!({
            "type": "function",
            "name": "cancel_hang_up",
            "description": "Cancel the hang up you previously requested",
            "parameters": {},
        }));
    }
    if !config.knowledge_bases.is_empty() {
        tools.push(json!({
            "type": "function",
            "name": "query_documents",
            "description": "Query the documents you have access to and return the most relevant information",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The query to ask the documents",
                    },
                },
                "required": ["query"],
            },
        }));
    }
    if config.text_messaging {
        tools.push(json!({
            "type": "function",
            "name": "send_text_message",
            "description": "Send a text message",
            "parameters": {
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "The text message to send",
                    },
                },
                "required": ["message"],
            },
        }));
    }
    if !config.transfer_numbers.is_empty() {
        let labels: Vec<&str> = config
            .transfer_numbers
            .iter()
            .map(|t| t.label.as_str())
            .collect();
        tools.push(json!({
            "type": "function",
            "name": "transfer_call",
            "description": "Transfer the call to the relevant phone number",
            "parameters": {
                "type": "object",
                "properties": {
                    "phone_number_label": {
                        "type": "string",
                        "description": "The label of the phone number to transfer the call to",
                        "enum": labels,
                    },
                },
                "required": ["phone_number_label"],
            },
        }));
    }
    if config.keypad {
        tools.push(json!({
            "type": "function",
            "name": "enter_keypad",
            "description": "Enter a set of numbers or characters on the keypad",
            "parameters": {
                "type": "object",
                "properties": {
                    "digits": {
                        "type": "string",
                        "description": "The digits to enter",
                    },
                },
                "required": ["digits"],
            },
        }));
    }
    tools
}

/// Transport-side effects the bridge applies after a dispatch.
#[derive(Debug, PartialEq)]
pub enum ToolAction {
    /// Browser: inject the pre-recorded hang-up tone as a downlink chunk.
    PlayHangUpTone,
    /// Browser: surface an out-of-band UI message.
    ShowMessage { title: String, body: String },
    /// Telephony: stop forwarding model audio (answering machine detected).
    EndDownlink,
}

/// Identity of the call the dispatcher acts for.
#[derive(Clone)]
pub struct CallContext {
    pub call_id: Uuid,
    pub direction: CallDirection,
    pub from_number: String,
    pub to_number: String,
    pub tool_configuration: ToolConfiguration,
    /// Externally reachable host for status-callback URLs.
    pub public_host: String,
}

/// Provider access for telephony transports; browser calls run without one.
#[derive(Clone)]
pub struct TelephonyContext {
    pub client: Arc<TelephonyClient>,
    pub call_sid: String,
}

pub struct Dispatcher {
    session: SessionHandle,
    control: CallControl,
    knowledge: Arc<KnowledgeService>,
    store: Arc<CallStore>,
    telephony: Option<TelephonyContext>,
    call: CallContext,
}

#[derive(Deserialize)]
struct HangUpArgs {
    reason: HangUpReasonArg,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum HangUpReasonArg {
    EndOfCall,
    AnsweringMachine,
}

#[derive(Deserialize)]
struct QueryArgs {
    query: String,
}

#[derive(Deserialize)]
struct MessageArgs {
    message: String,
}

#[derive(Deserialize)]
struct TransferArgs {
    phone_number_label: String,
}

#[derive(Deserialize)]
struct KeypadArgs {
    digits: String,
}

impl Dispatcher {
    pub fn new(
        session: SessionHandle,
        control: CallControl,
        knowledge: Arc<KnowledgeService>,
        store: Arc<CallStore>,
        telephony: Option<TelephonyContext>,
        call: CallContext,
    ) -> Self {
        Self {
            session,
            control,
            knowledge,
            store,
            telephony,
            call,
        }
    }

    /// Interpret one model tool call. Unknown names and invalid arguments are
    /// logged and ignored; nothing here terminates the call directly.
    pub async fn dispatch(&self, invocation: &ToolInvocation) -> Vec<ToolAction> {
        match invocation.name.as_str() {
            "hang_up" => self.hang_up(invocation).await,
            "cancel_hang_up" => {
                self.control.cancel_bot_termination().await;
                info!("Hang up cancelled");
                Vec::new()
            }
            "query_documents" => self.query_documents(invocation).await,
            "send_text_message" => self.send_text_message(invocation).await,
            "transfer_call" => self.transfer_call(invocation).await,
            "enter_keypad" => self.enter_keypad(invocation).await,
            other => {
                warn!("Received unexpected function call: {other}");
                Vec::new()
            }
        }
    }

    async fn hang_up(&self, invocation: &ToolInvocation) -> Vec<ToolAction> {
        let Some(args) = parse_args::<HangUpArgs>(invocation) else {
            return Vec::new();
        };
        match args.reason {
            HangUpReasonArg::AnsweringMachine => {
                self.control
                    .request_termination(Termination::new(TerminationCause::VoiceMailBot))
                    .await;
                info!("Answering machine detected, not leaving a message");
                if self.telephony.is_some() {
                    vec![ToolAction::EndDownlink]
                } else {
                    vec![ToolAction::PlayHangUpTone]
                }
            }
            HangUpReasonArg::EndOfCall => {
                self.control
                    .request_termination(Termination::new(TerminationCause::EndOfCallBot))
                    .await;
                info!("Hang up requested by bot");
                if self.telephony.is_some() {
                    Vec::new()
                } else {
                    vec![ToolAction::PlayHangUpTone]
                }
            }
        }
    }

    async fn query_documents(&self, invocation: &ToolInvocation) -> Vec<ToolAction> {
        let Some(args) = parse_args::<QueryArgs>(invocation) else {
            return Vec::new();
        };
        let answer = self
            .knowledge
            .query(&args.query, &self.call.tool_configuration.knowledge_bases)
            .await;
        if let Err(e) = self
            .session
            .send_tool_result(
                invocation.item_id.clone(),
                invocation.call_id.clone(),
                answer,
            )
            .await
        {
            warn!("Failed to return document query result: {e}");
        }
        Vec::new()
    }

    async fn send_text_message(&self, invocation: &ToolInvocation) -> Vec<ToolAction> {
        let Some(args) = parse_args::<MessageArgs>(invocation) else {
            return Vec::new();
        };
        let message_id = Uuid::new_v4();
        match &self.telephony {
            Some(telephony) => {
                let (sending, receiving) = match self.call.direction {
                    CallDirection::Outbound => {
                        (self.call.from_number.as_str(), self.call.to_number.as_str())
                    }
                    _ => (self.call.to_number.as_str(), self.call.from_number.as_str()),
                };
                let status_callback = format!(
                    "https://{}/api/v1/messages/{message_id}/status",
                    self.call.public_host
                );
                match telephony
                    .client
                    .send_sms(sending, receiving, &args.message, &status_callback)
                    .await
                {
                    Ok(sid) => {
                        if let Err(e) = self
                            .store
                            .insert_text_message(
                                message_id,
                                self.call.call_id,
                                sending,
                                receiving,
                                &args.message,
                                &sid,
                            )
                            .await
                        {
                            warn!("Failed to record text message: {e:#}");
                        }
                    }
                    Err(e) => warn!("Failed to send text message: {e:#}"),
                }
                Vec::new()
            }
            None => {
                if let Err(e) = self
                    .store
                    .insert_text_message(
                        message_id,
                        self.call.call_id,
                        BROWSER_NAME,
                        BROWSER_NAME,
                        &args.message,
                        "no-sid",
                    )
                    .await
                {
                    warn!("Failed to record text message: {e:#}");
                }
                vec![ToolAction::ShowMessage {
                    title: "SMS Message".to_string(),
                    body: args.message,
                }]
            }
        }
    }

    async fn transfer_call(&self, invocation: &ToolInvocation) -> Vec<ToolAction> {
        let Some(args) = parse_args::<TransferArgs>(invocation) else {
            return Vec::new();
        };
        match self
            .call
            .tool_configuration
            .transfer_number(&args.phone_number_label)
        {
            Some(number) => {
                self.control
                    .request_termination(Termination::transferred(number.to_string()))
                    .await;
            }
            None => warn!(
                "Transfer call number not found: {}, call will not be transferred",
                args.phone_number_label
            ),
        }
        Vec::new()
    }

    async fn enter_keypad(&self, invocation: &ToolInvocation) -> Vec<ToolAction> {
        let Some(args) = parse_args::<KeypadArgs>(invocation) else {
            return Vec::new();
        };
        match &self.telephony {
            Some(telephony) => {
                if let Err(e) = telephony
                    .client
                    .send_dtmf(&telephony.call_sid, &args.digits)
                    .await
                {
                    warn!("Failed to send DTMF digits: {e:#}");
                }
                Vec::new()
            }
            None => vec![ToolAction::ShowMessage {
                title: "Keypad".to_string(),
                body: args.digits,
            }],
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(invocation: &ToolInvocation) -> Option<T> {
    match serde_json::from_str(&invocation.arguments) {
        Ok(args) => Some(args),
        Err(e) => {
            warn!(
                "Invalid arguments for tool {}: {e} ({})",
                invocation.name, invocation.arguments
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KnowledgeBaseRef, TransferNumber};

    fn names(tools: &[Value]) -> Vec<&str> {
        tools.iter().filter_map(|t| t["name"].as_str()).collect()
    }

    #[test]
    fn test_default_config_gets_hang_up_only() {
        let tools = agent_tools(&ToolConfiguration::default());
        assert_eq!(names(&tools), vec!["hang_up", "cancel_hang_up"]);
    }

    #[test]
    fn test_full_config_declares_all_tools() {
        let config = ToolConfiguration {
            hang_up: true,
            knowledge_bases: vec![KnowledgeBaseRef {
                id: Uuid::new_v4(),
                name: "faq".to_string(),
            }],
            transfer_numbers: vec![
                TransferNumber {
                    label: "support".to_string(),
                    phone_number: "+15550100".to_string(),
                },
                TransferNumber {
                    label: "sales".to_string(),
                    phone_number: "+15550101".to_string(),
                },
            ],
            text_messaging: true,
            keypad: true,
        };
        let tools = agent_tools(&config);
        assert_eq!(
            names(&tools),
            vec![
                "hang_up",
                "cancel_hang_up",
                "query_documents",
                "send_text_message",
                "transfer_call",
                "enter_keypad"
            ]
        );
        let transfer = tools
            .iter()
            .find(|t| t["name"] == "transfer_call")
            .unwrap();
        assert_eq!(
            transfer["parameters"]["properties"]["phone_number_label"]["enum"],
            json!(["support", "sales"])
        );
    }

    #[test]
    fn test_hang_up_reason_enum_in_schema() {
        let tools = agent_tools(&ToolConfiguration::default());
        let hang_up = tools.iter().find(|t| t["name"] == "hang_up").unwrap();
        assert_eq!(
            hang_up["parameters"]["properties"]["reason"]["enum"],
            json!(["end_of_call", "answering_machine"])
        );
    }

    #[test]
    fn test_hang_up_args_parse() {
        let invocation = ToolInvocation {
            name: "hang_up".to_string(),
            arguments: r#"{"reason":"answering_machine"}"#.to_string(),
            call_id: "call_1".to_string(),
            item_id: "it_1".to_string(),
        };
        let args: HangUpArgs = parse_args(&invocation).unwrap();
        assert!(matches!(args.reason, HangUpReasonArg::AnsweringMachine));

        let bad = ToolInvocation {
            arguments: r#"{"reason":"goodbye"}"#.to_string(),
            ..invocation
        };
        assert!(parse_args::<HangUpArgs>(&bad).is_none());
    }
}

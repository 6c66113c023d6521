//! Bridge between model function calls and local tools.
//!
//! The service declares its tools in the setup message and later invokes
//! them with a call id. Every invocation gets exactly one correlated
//! `FunctionResponse`; the agent waits for it before it continues talking.

use std::collections::HashMap;

use rand::Rng;
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::ToolArgumentError;
use crate::protocol::{FunctionCall, FunctionDeclaration, FunctionResponse, FunctionResult};

pub const SUBMIT_TICKET: &str = "submitTicket";

/// A completed support ticket, built from one `submitTicket` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TicketRecord {
    pub name: String,
    pub email: String,
    pub municipality: String,
    pub system: String,
    pub issue: String,
}

impl TicketRecord {
    /// Argument names in declaration order.
    pub const FIELDS: [&'static str; 5] = ["name", "email", "municipality", "system", "issueDescription"];

    /// Map invocation arguments 1:1. Every field must be a non-blank string.
    pub fn from_args(args: &Value) -> Result<Self, ToolArgumentError> {
        let obj = args.as_object().ok_or(ToolArgumentError::NotAnObject)?;

        let field = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        let missing: Vec<&'static str> = Self::FIELDS
            .into_iter()
            .filter(|key| field(*key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ToolArgumentError::MissingFields(missing));
        }

        Ok(Self {
            name: field("name").unwrap_or_default(),
            email: field("email").unwrap_or_default(),
            municipality: field("municipality").unwrap_or_default(),
            system: field("system").unwrap_or_default(),
            issue: field("issueDescription").unwrap_or_default(),
        })
    }
}

/// What a tool produced for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    /// Text returned to the agent.
    pub result: String,
    pub ticket: Option<TicketRecord>,
}

pub trait SessionTool: Send + Sync {
    fn name(&self) -> &str;
    fn declaration(&self) -> FunctionDeclaration;
    fn call(&self, args: &Value) -> ToolOutcome;
}

/// `submitTicket`: turns the collected caller details into a `TicketRecord`.
pub struct SubmitTicketTool;

impl SubmitTicketTool {
    fn reference() -> u32 {
        rand::thread_rng().gen_range(0..10_000)
    }
}

impl SessionTool for SubmitTicketTool {
    fn name(&self) -> &str {
        SUBMIT_TICKET
    }

    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: SUBMIT_TICKET.to_string(),
            description: "Finalizes the support request by submitting the collected user information into a ticket."
                .to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "name": { "type": "STRING", "description": "Name of the user" },
                    "email": { "type": "STRING", "description": "Email of the user" },
                    "municipality": { "type": "STRING", "description": "The municipality the user is calling from" },
                    "system": { "type": "STRING", "description": "The SMC system related to the inquiry (e.g., Contabilidad, Tesorería)" },
                    "issueDescription": { "type": "STRING", "description": "A summary of the reported problem or requirement" }
                },
                "required": TicketRecord::FIELDS,
            }),
        }
    }

    fn call(&self, args: &Value) -> ToolOutcome {
        match TicketRecord::from_args(args) {
            Ok(ticket) => ToolOutcome {
                result: format!("Ticket creado. Referencia #SMC-{}", Self::reference()),
                ticket: Some(ticket),
            },
            Err(e) => {
                log::warn!("submitTicket rejected: {}", e);
                let detail = match &e {
                    ToolArgumentError::MissingFields(fields) => fields.join(", "),
                    ToolArgumentError::NotAnObject => TicketRecord::FIELDS.join(", "),
                };
                ToolOutcome {
                    result: format!(
                        "Ticket no creado. Faltan datos: {}. Solicite esos datos al usuario y vuelva a llamar a submitTicket.",
                        detail
                    ),
                    ticket: None,
                }
            }
        }
    }
}

/// Result of dispatching one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub response: FunctionResponse,
    pub ticket: Option<TicketRecord>,
}

pub struct ToolBridge {
    tools: HashMap<String, Box<dyn SessionTool>>,
}

impl Default for ToolBridge {
    fn default() -> Self {
        let mut bridge = Self::new();
        bridge.register_tool(Box::new(SubmitTicketTool));
        bridge
    }
}

impl ToolBridge {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register_tool(&mut self, tool: Box<dyn SessionTool>) {
        log::info!("Registered tool: {}", tool.name());
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Declarations for the setup message, sorted by name.
    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        let mut decls: Vec<_> = self.tools.values().map(|t| t.declaration()).collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name));
        decls
    }

    /// Run the invoked tool and build the correlated response. Unknown tools
    /// still get a response so the agent is never left waiting.
    pub fn dispatch(&self, call: &FunctionCall) -> Dispatch {
        let outcome = match self.tools.get(&call.name) {
            Some(tool) => tool.call(&call.args),
            None => {
                log::warn!("Invocation of unknown tool {} ({})", call.name, call.id);
                ToolOutcome {
                    result: format!("Tool {} not found", call.name),
                    ticket: None,
                }
            }
        };

        Dispatch {
            response: FunctionResponse {
                id: call.id.clone(),
                name: call.name.clone(),
                response: FunctionResult {
                    result: outcome.result,
                },
            },
            ticket: outcome.ticket,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str, name: &str, args: Value) -> FunctionCall {
        FunctionCall {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    fn full_args() -> Value {
        json!({
            "name": "Ana",
            "email": "a@x.cl",
            "municipality": "Maipú",
            "system": "Tesorería",
            "issueDescription": "No carga el módulo"
        })
    }

    #[test]
    fn test_complete_invocation_yields_ticket_and_response() {
        let bridge = ToolBridge::default();
        let dispatch = bridge.dispatch(&call("fc-42", SUBMIT_TICKET, full_args()));

        assert_eq!(
            dispatch.ticket,
            Some(TicketRecord {
                name: "Ana".into(),
                email: "a@x.cl".into(),
                municipality: "Maipú".into(),
                system: "Tesorería".into(),
                issue: "No carga el módulo".into(),
            })
        );
        assert_eq!(dispatch.response.id, "fc-42");
        assert_eq!(dispatch.response.name, SUBMIT_TICKET);

        let result = &dispatch.response.response.result;
        let reference = result
            .strip_prefix("Ticket creado. Referencia #SMC-")
            .expect("confirmation prefix");
        let n: u32 = reference.parse().unwrap();
        assert!(n < 10_000);
    }

    #[test]
    fn test_references_stay_in_range_and_vary() {
        let refs: Vec<u32> = (0..64).map(|_| SubmitTicketTool::reference()).collect();
        assert!(refs.iter().all(|&n| n < 10_000));
        assert!(refs.iter().any(|&n| n != refs[0]));
    }

    #[test]
    fn test_missing_fields_still_answer() {
        let bridge = ToolBridge::default();
        let mut args = full_args();
        args.as_object_mut().unwrap().remove("email");
        args["system"] = json!("   ");

        let dispatch = bridge.dispatch(&call("fc-1", SUBMIT_TICKET, args));
        assert!(dispatch.ticket.is_none());
        assert_eq!(dispatch.response.id, "fc-1");
        assert!(dispatch.response.response.result.contains("email, system"));
    }

    #[test]
    fn test_non_object_args() {
        assert_eq!(
            TicketRecord::from_args(&json!("Ana")),
            Err(ToolArgumentError::NotAnObject)
        );
        let outcome = SubmitTicketTool.call(&Value::Null);
        assert!(outcome.ticket.is_none());
    }

    #[test]
    fn test_unknown_tool_gets_response() {
        let bridge = ToolBridge::default();
        let dispatch = bridge.dispatch(&call("x", "transferCall", json!({})));
        assert!(dispatch.ticket.is_none());
        assert_eq!(dispatch.response.id, "x");
        assert_eq!(dispatch.response.response.result, "Tool transferCall not found");
    }

    #[test]
    fn test_declaration_requires_all_fields() {
        let decls = ToolBridge::default().declarations();
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].name, SUBMIT_TICKET);
        assert_eq!(
            decls[0].parameters["required"],
            json!(["name", "email", "municipality", "system", "issueDescription"])
        );
    }
}

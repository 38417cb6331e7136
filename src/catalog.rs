//! Tool catalog
//!
//! The static, versioned set of operations the reasoning engine may request.
//! Pure data: the catalog is what the engine sees; the executor is what
//! actually enforces it. Every parameter the executor reads appears here.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize)]
pub enum ParameterKind {
    String,
    Number,
    Boolean,
    Enum(Vec<&'static str>),
    Object,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterSpec {
    pub name: &'static str,
    pub kind: ParameterKind,
    pub required: bool,
    pub description: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Vec<ParameterSpec>,
}

fn string(name: &'static str, required: bool, description: &'static str) -> ParameterSpec {
    ParameterSpec {
        name,
        kind: ParameterKind::String,
        required,
        description,
    }
}

fn number(name: &'static str, required: bool, description: &'static str) -> ParameterSpec {
    ParameterSpec {
        name,
        kind: ParameterKind::Number,
        required,
        description,
    }
}

fn kind_enum() -> ParameterKind {
    ParameterKind::Enum(vec!["income", "expense"])
}

/// The full catalog, built once at first use. Deterministic and
/// side-effect-free.
pub fn catalog() -> &'static [ToolDefinition] {
    static CATALOG: OnceLock<Vec<ToolDefinition>> = OnceLock::new();
    CATALOG.get_or_init(build_catalog)
}

pub fn find_tool(name: &str) -> Option<&'static ToolDefinition> {
    catalog().iter().find(|t| t.name == name)
}

fn build_catalog() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "add_transaction",
            description: "Record a new transaction. Amount is always non-negative; direction comes from the type field.",
            parameters: vec![
                number("amount", true, "Transaction amount, non-negative"),
                ParameterSpec {
                    name: "type",
                    kind: kind_enum(),
                    required: true,
                    description: "Whether this is income or an expense",
                },
                string("description", true, "Short free-text description, e.g. merchant name"),
                string("category", false, "Category name; must match an existing category"),
                string("date", false, "RFC 3339 date-time; defaults to now"),
            ],
        },
        ToolDefinition {
            name: "update_transaction",
            description: "Update fields of an existing transaction by id.",
            parameters: vec![
                string("transaction_id", true, "The transaction's id"),
                number("amount", false, "New amount"),
                ParameterSpec {
                    name: "type",
                    kind: kind_enum(),
                    required: false,
                    description: "New transaction type",
                },
                string("description", false, "New description"),
                string("category", false, "New category name; must match an existing category"),
                string("date", false, "New RFC 3339 date-time"),
            ],
        },
        ToolDefinition {
            name: "delete_transaction",
            description: "Delete a transaction by id.",
            parameters: vec![string("transaction_id", true, "The transaction's id")],
        },
        ToolDefinition {
            name: "get_transactions",
            description: "List recent transactions, optionally filtered.",
            parameters: vec![
                string("category", false, "Substring match on category name"),
                string("start_date", false, "RFC 3339 lower bound"),
                string("end_date", false, "RFC 3339 upper bound"),
                ParameterSpec {
                    name: "type",
                    kind: kind_enum(),
                    required: false,
                    description: "Restrict to income or expense",
                },
                number("limit", false, "Maximum rows to return (default 10)"),
            ],
        },
        ToolDefinition {
            name: "get_spending_analysis",
            description: "Summarize spending: month-to-date total and per-budget usage.",
            parameters: vec![],
        },
        ToolDefinition {
            name: "create_budget_with_category",
            description: "Create a budget for a category, creating the category only if it does not already exist (case-insensitive).",
            parameters: vec![
                string("category_name", true, "Category the budget tracks"),
                string("budget_name", false, "Budget display name; defaults to the category name"),
                number("amount", true, "Monthly budget amount, non-negative"),
            ],
        },
        ToolDefinition {
            name: "update_budget",
            description: "Update a budget's amount or name. Accepts a budget_id, or a budget_name matched case-insensitively against budget and category names.",
            parameters: vec![
                string("budget_id", false, "Direct budget id"),
                string("budget_name", false, "Fuzzy name to resolve when no id is given"),
                number("amount", false, "New monthly amount"),
                string("new_name", false, "New display name"),
            ],
        },
        ToolDefinition {
            name: "delete_budget",
            description: "Delete a budget by id or by fuzzy name match.",
            parameters: vec![
                string("budget_id", false, "Direct budget id"),
                string("budget_name", false, "Fuzzy name to resolve when no id is given"),
            ],
        },
        ToolDefinition {
            name: "get_budgets",
            description: "List the user's budgets with month-to-date spend and status.",
            parameters: vec![],
        },
        ToolDefinition {
            name: "create_category",
            description: "Create a new transaction category.",
            parameters: vec![string("name", true, "Category name")],
        },
    ]
}

/// Render the catalog as Gemini `functionDeclarations` JSON Schema.
pub fn to_function_declarations() -> Value {
    let declarations: Vec<Value> = catalog()
        .iter()
        .map(|tool| {
            let mut properties = serde_json::Map::new();
            let mut required = Vec::new();

            for param in &tool.parameters {
                let schema = match &param.kind {
                    ParameterKind::String => json!({
                        "type": "string",
                        "description": param.description,
                    }),
                    ParameterKind::Number => json!({
                        "type": "number",
                        "description": param.description,
                    }),
                    ParameterKind::Boolean => json!({
                        "type": "boolean",
                        "description": param.description,
                    }),
                    ParameterKind::Enum(values) => json!({
                        "type": "string",
                        "enum": values,
                        "description": param.description,
                    }),
                    ParameterKind::Object => json!({
                        "type": "object",
                        "description": param.description,
                    }),
                };
                properties.insert(param.name.to_string(), schema);
                if param.required {
                    required.push(param.name);
                }
            }

            json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            })
        })
        .collect();

    Value::Array(declarations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_names_are_unique() {
        let mut names: Vec<&str> = catalog().iter().map(|t| t.name).collect();
        let before = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), before);
    }

    #[test]
    fn lookup_by_name() {
        assert!(find_tool("add_transaction").is_some());
        assert!(find_tool("transfer_funds").is_none());
    }

    #[test]
    fn declarations_carry_required_fields() {
        let declarations = to_function_declarations();
        let add = declarations
            .as_array()
            .unwrap()
            .iter()
            .find(|d| d["name"] == "add_transaction")
            .unwrap();

        let required: Vec<&str> = add["parameters"]["required"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(required.contains(&"amount"));
        assert!(required.contains(&"type"));
        assert!(!required.contains(&"category"));

        assert_eq!(
            add["parameters"]["properties"]["type"]["enum"],
            serde_json::json!(["income", "expense"])
        );
    }
}

use helpdesk::registry::{NewWebhook, WebhookPatch};
use helpdesk::service::{HelpdeskCore, NewComment, NewTicket, Page, TicketFilter};
use helpdesk::sla::{NewSlaPolicy, SlaPolicyPatch};
use helpdesk::types::TicketStatus;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

type Result = std::result::Result<Value, String>;

fn parse<T: DeserializeOwned>(input: &Value) -> std::result::Result<T, String> {
    serde_json::from_value(input.clone()).map_err(|e| format!("invalid input: {e}"))
}

fn field<'a>(input: &'a Value, name: &str) -> std::result::Result<&'a str, String> {
    input
        .get(name)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing required field: {name}"))
}

fn to_value<T: Serialize>(v: T) -> Result {
    serde_json::to_value(v).map_err(|e| e.to_string())
}

pub async fn execute(operation: &str, input: &Value, core: &HelpdeskCore) -> Result {
    match operation {
        // Tickets
        "create_ticket" => to_value(core.create_ticket(parse::<NewTicket>(input)?).await),
        "get_ticket" => to_value(
            core.get_ticket(field(input, "ticket_id")?)
                .await
                .map_err(|e| e.to_string())?,
        ),
        "list_tickets" => {
            let tickets = core.list_tickets(&parse::<TicketFilter>(input)?).await;
            let count = tickets.len();
            Ok(serde_json::json!({ "tickets": tickets, "count": count }))
        }
        "update_ticket_status" => {
            let status: TicketStatus = serde_json::from_value(
                input.get("status").cloned().unwrap_or(Value::Null),
            )
            .map_err(|e| format!("invalid status: {e}"))?;
            let ticket = core
                .change_status(field(input, "ticket_id")?, status)
                .await
                .map_err(|e| e.to_string())?;
            to_value(ticket)
        }
        "assign_ticket" => {
            let ticket = core
                .assign(field(input, "ticket_id")?, field(input, "assignee_id")?)
                .await
                .map_err(|e| e.to_string())?;
            to_value(ticket)
        }
        "add_comment" => {
            let comment = core
                .add_comment(field(input, "ticket_id")?, parse::<NewComment>(input)?)
                .await
                .map_err(|e| e.to_string())?;
            to_value(comment)
        }
        "list_comments" => {
            let comments = core
                .comments(field(input, "ticket_id")?)
                .await
                .map_err(|e| e.to_string())?;
            let count = comments.len();
            Ok(serde_json::json!({ "comments": comments, "count": count }))
        }
        "get_sla_metrics" => {
            let days = input
                .get("days")
                .and_then(|v| v.as_u64())
                .map_or(30, |d| d.min(u64::from(u32::MAX)) as u32);
            to_value(core.sla_metrics(days).await)
        }
        "get_ticket_sla" => to_value(
            core.sla_snapshot(field(input, "ticket_id")?)
                .await
                .map_err(|e| e.to_string())?,
        ),

        // SLA policies
        "create_sla_policy" => to_value(
            core.create_policy(parse::<NewSlaPolicy>(input)?)
                .await
                .map_err(|e| e.to_string())?,
        ),
        "list_sla_policies" => {
            let active_only = input
                .get("active_only")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let policies = core.list_policies(active_only).await;
            let count = policies.len();
            Ok(serde_json::json!({ "policies": policies, "count": count }))
        }
        "get_sla_policy" => to_value(
            core.get_policy(field(input, "policy_id")?)
                .await
                .map_err(|e| e.to_string())?,
        ),
        "update_sla_policy" => to_value(
            core.update_policy(field(input, "policy_id")?, parse::<SlaPolicyPatch>(input)?)
                .await
                .map_err(|e| e.to_string())?,
        ),
        "delete_sla_policy" => {
            core.delete_policy(field(input, "policy_id")?)
                .await
                .map_err(|e| e.to_string())?;
            Ok(serde_json::json!({ "deleted": true }))
        }

        // Webhooks
        "create_webhook" => to_value(
            core.create_webhook(parse::<NewWebhook>(input)?)
                .await
                .map_err(|e| e.to_string())?,
        ),
        "list_webhooks" => {
            let webhooks = core.list_webhooks().await;
            let count = webhooks.len();
            Ok(serde_json::json!({ "webhooks": webhooks, "count": count }))
        }
        "get_webhook" => to_value(
            core.get_webhook(field(input, "webhook_id")?)
                .await
                .map_err(|e| e.to_string())?,
        ),
        "update_webhook" => to_value(
            core.update_webhook(field(input, "webhook_id")?, parse::<WebhookPatch>(input)?)
                .await
                .map_err(|e| e.to_string())?,
        ),
        "delete_webhook" => {
            core.delete_webhook(field(input, "webhook_id")?)
                .await
                .map_err(|e| e.to_string())?;
            Ok(serde_json::json!({ "deleted": true }))
        }
        "get_webhook_logs" => {
            let deliveries = core
                .delivery_log(field(input, "webhook_id")?, parse::<Page>(input)?)
                .await
                .map_err(|e| e.to_string())?;
            Ok(serde_json::json!({ "deliveries": deliveries }))
        }
        "get_webhook_stats" => to_value(
            core.subscription_stats(field(input, "webhook_id")?)
                .await
                .map_err(|e| e.to_string())?,
        ),

        _ => Err(format!("Unknown operation: {operation}")),
    }
}

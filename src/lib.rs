//! Demo embedding of the `rpcamqp_lite` messaging core: a toy project
//! catalogue service and a gateway-style caller, wired over RabbitMQ.
//!
//! The real services put a GraphQL executor behind
//! [`rpcamqp_lite::RpcServer::receive`]; the demo stands one in with a
//! fixed catalogue so the binaries run against a bare broker.

use anyhow::bail;
use rpcamqp_lite::{ReplyEnvelope, RequestEnvelope};
use serde_json::json;

/// Resolve the demo project queries against a fixed catalogue.
pub fn execute_projects(req: &RequestEnvelope) -> anyhow::Result<ReplyEnvelope> {
    if req.query.contains("projectsOfEvent") {
        let evid = req
            .variables
            .get("evid")
            .and_then(|v| v.as_str())
            .unwrap_or("E0");
        Ok(ReplyEnvelope::ok(json!({
            "projectsOfEvent": [
                { "pid": format!("{evid}-P1"), "name": "Orbital greenhouse" },
                { "pid": format!("{evid}-P2"), "name": "Tidal battery" },
            ]
        })))
    } else {
        bail!("unsupported query: {}", req.query)
    }
}

/// The broker URL the demo binaries connect to.
pub fn broker_url() -> String {
    std::env::var("AMQP_URL").unwrap_or_else(|_| "amqp://localhost:5672".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_query_resolves() {
        let req = RequestEnvelope::new(
            "query($evid:ID!){projectsOfEvent(evid:$evid){pid name}}",
            json!({ "evid": "E1" }),
        );
        let reply = execute_projects(&req).unwrap();
        assert!(!reply.is_err());
        let data = reply.data.unwrap();
        assert_eq!(data["projectsOfEvent"][0]["pid"], "E1-P1");
    }

    #[test]
    fn test_unknown_query_fails() {
        let req = RequestEnvelope::new("query { somethingElse }", json!(null));
        assert!(execute_projects(&req).is_err());
    }
}

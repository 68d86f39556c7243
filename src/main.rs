use std::sync::Arc;

use finchat::services::agent::{LlmAgent, ToolSpec};
use finchat::services::approval::spawn_sweep_task;
use finchat::services::conversation::PgConversationStore;
use finchat::{db, llm, routes, state};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()
        .expect("invalid PORT");

    let pool = db::init_pool(&database_url)
        .await
        .expect("database init failed");

    // Initialize the agent backend (non-fatal: chat runs degraded without it).
    let agent = match llm::LlmClient::from_env() {
        Ok(client) => {
            tracing::info!(model = client.model(), "agent backend initialized");
            let agent: Arc<dyn finchat::services::agent::AgentBackend> =
                Arc::new(LlmAgent::new(Arc::new(client), side_effecting_tools()));
            Some(agent)
        }
        Err(e) => {
            tracing::warn!(error = %e, "agent backend not configured — chat turns disabled");
            None
        }
    };

    let store = Arc::new(PgConversationStore::new(pool.clone()));
    let state = state::AppState::new(pool, store, agent, None);

    // Spawn the approval expiry sweep.
    let _sweep = spawn_sweep_task(state.gateway.clone());

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "finchat listening");
    axum::serve(listener, app).await.expect("server failed");
}

/// Side-effecting tools the agent may request approval for. Execution is
/// wired separately (a `ToolExecutor`); this catalog only shapes requests.
fn side_effecting_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "send_money".into(),
            description: "Send a peer-to-peer payment from the user's account.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "to": {"type": "string", "description": "Recipient account handle"},
                    "amount": {"type": "number", "description": "Amount in dollars"},
                    "memo": {"type": "string"}
                },
                "required": ["to", "amount"]
            }),
        },
        ToolSpec {
            name: "request_money".into(),
            description: "Request a payment from another account.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "from": {"type": "string", "description": "Payer account handle"},
                    "amount": {"type": "number", "description": "Amount in dollars"},
                    "memo": {"type": "string"}
                },
                "required": ["from", "amount"]
            }),
        },
    ]
}

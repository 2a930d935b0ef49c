use anyhow::Result;
use rpcamqp_lite::{Connection, RpcClient, RpcConfig};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let conn = Connection::connect(RpcConfig::new(msa_prototype::broker_url())).await?;
    let client = RpcClient::new(&conn);

    let data = client
        .call(
            "api-project",
            "query($evid:ID!){projectsOfEvent(evid:$evid){pid name}}",
            json!({ "evid": "E1" }),
        )
        .await?;
    println!("{}", serde_json::to_string_pretty(&data)?);

    conn.disconnect().await;
    Ok(())
}

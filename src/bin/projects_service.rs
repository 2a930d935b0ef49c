use anyhow::Result;
use rpcamqp_lite::{Connection, RpcConfig, RpcServer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let conn = Connection::connect(RpcConfig::new(msa_prototype::broker_url())).await?;
    RpcServer::new(&conn)
        .receive("api-project", |req| async move {
            msa_prototype::execute_projects(&req)
        })
        .await?;

    println!("project service ready, waiting for requests");
    tokio::signal::ctrl_c().await?;
    conn.disconnect().await;
    Ok(())
}

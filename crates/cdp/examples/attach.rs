//! Attach to the first page target and print pause events

use cdp::protocol::TargetInfo;
use cdp::{Connection, ConnectionConfig};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://localhost:9222/devtools/browser".to_string());
    let mut config = ConnectionConfig::new(url);
    config.trace_protocol = true;

    let connection = Connection::connect(&config).await?;
    println!("Connected to {}", config.url);

    let result = connection
        .browser_session()
        .send_or_die("Target.getTargets", None)
        .await?;
    let targets: Vec<TargetInfo> = serde_json::from_value(result["targetInfos"].clone())?;

    let Some(page) = targets.iter().find(|t| t.target_type == "page") else {
        println!("No page targets");
        connection.dispose();
        return Ok(());
    };
    println!("Attaching to {} ({})", page.title, page.url);

    let session = connection.attach_to_target(&page.target_id).await?;
    let _paused = session.on("Debugger.paused", |params| {
        println!("Paused: {}", params["reason"]);
    });
    let _gone = session.on_disconnected(|| println!("Target gone"));

    session.send_or_die("Debugger.enable", None).await?;
    session
        .send("Runtime.evaluate", Some(json!({ "expression": "debugger" })))
        .await;

    tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;

    session.send("Debugger.resume", None).await;
    session.detach().await?;
    connection.dispose();
    println!("Disconnected");

    Ok(())
}

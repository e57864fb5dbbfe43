use std::sync::Arc;

use serde::{Deserialize, Serialize};
use weft::prelude::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Greeted {
    name: String,
}

/// Start a greeter service on TCP and run until SIGINT/SIGTERM.
///
/// ```text
/// WEFT_BIND_ADDR=127.0.0.1:7000 cargo run -p demo-greeter
/// ```
#[tokio::main]
async fn main() -> weft::Result<()> {
    let broker = Arc::new(MemoryBroker::new());
    broker.connect().await.map_err(weft::Error::from)?;
    let pubsub = PubSub::new(broker.clone());

    let service = Service::build("greeter")
        .version("1.0.0")
        .bind("127.0.0.1:7000")
        .broker(broker)
        .endpoint("/hello", "name", move |name: String| {
            let pubsub = pubsub.clone();
            async move {
                pubsub.publish("greetings", &Greeted { name: name.clone() }).await?;
                Ok(format!("Hello {name}!"))
            }
        })
        .subscribe("greetings", |greeted: Greeted| async move {
            tracing::info!(name = %greeted.name, "someone was greeted");
            Ok(())
        })
        .on_shutdown(|| async {
            tracing::info!("greeter going down");
            Ok(())
        });

    weft::run(service).await
}

// Dump recent samples for one user as JSON, newest first.
//
// Usage: cargo run --example dump_history -- USER_ID [DB_PATH] [LIMIT] [DEVICE_ID]
//   DB_PATH  default: ./data/perfsync.db
//   LIMIT    default: 5

use perfsync::models::HistoryFilter;
use perfsync::store::{RemoteStore, SqliteStore};
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let Some(user_id) = args.get(1) else {
        anyhow::bail!("usage: dump_history USER_ID [DB_PATH] [LIMIT] [DEVICE_ID]");
    };
    let path = args.get(2).map(String::as_str).unwrap_or("./data/perfsync.db");
    let limit: u32 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(5);

    let store = SqliteStore::connect(path, 1, 30).await?;
    let filter = HistoryFilter {
        device_id: args.get(4).cloned(),
        limit,
        ..Default::default()
    };
    let samples = store.query_samples(user_id, &filter).await?;

    println!("{}", serde_json::to_string_pretty(&samples)?);
    Ok(())
}

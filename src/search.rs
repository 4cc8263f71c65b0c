use anyhow::Result;

use crate::config::Config;
use crate::store::RuleStore;

/// Run the search command: keyword query over indexed rules.
pub async fn run_search(config: &Config, query: &str, limit: Option<i64>) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let store = RuleStore::connect(&config.db.path).await?;
    let hits = store.search(query, limit.unwrap_or(12)).await?;

    if hits.is_empty() {
        println!("No results.");
        store.close().await;
        return Ok(());
    }

    for hit in &hits {
        println!("{} [{}] {}", hit.id, hit.severity, hit.name);
        if let Some(description) = &hit.description {
            let first_line = description.lines().next().unwrap_or("");
            println!("    {}", first_line);
        }
    }
    println!();
    println!("{} result{}", hits.len(), if hits.len() == 1 { "" } else { "s" });

    store.close().await;
    Ok(())
}

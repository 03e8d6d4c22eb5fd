use std::collections::HashMap;

use katamari::error::Error;
use katamari::orm::{Orm, OrmConfig};
use katamari::search::SchemaFieldKind;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Error> {
    println!("Hello, Katamari!");

    let dir = tempfile::tempdir().expect("tempdir");
    let mut schema = HashMap::new();
    schema.insert("id".to_string(), SchemaFieldKind::Id);
    schema.insert("title".to_string(), SchemaFieldKind::Text);

    let config = OrmConfig {
        cache_capacity: 64,
        persistence_path: Some(dir.path().join("demo")),
        tx_log_path: dir.path().join("demo.txlog"),
        codec: Default::default(),
    };

    let orm = Orm::spawn(config, schema)?;
    orm.set("order:1", json!({"id": "order:1", "title": "first order"}), false, None).await?;
    orm.set("order:2", json!({"id": "order:2", "title": "second order"}), false, None).await?;

    let value = orm.get("order:1").await?;
    println!("order:1 = {value:?}");

    orm.flush_index()?;
    let results = orm.search("title:order", None, &HashMap::new(), None, None)?;
    println!("found {} documents", results.len());

    println!("Bye~");
    Ok(())
}

use futures::StreamExt;
use pgline::{Connection, Result};

pub async fn main() -> Result<()> {
    let conn = Connection::connect_env().await?;

    // Execute

    conn.execute("CREATE TEMP TABLE pgline(id serial, name text, active bool)").await?;

    let rows_affected = conn
        .execute("INSERT INTO pgline(name, active) VALUES ('Deez', true), ('Foo', false)")
        .await?;

    assert_eq!(rows_affected, 2);

    conn.execute("INSERT INTO pgline(name) VALUES (NULL)").await?;

    // Queries

    let rows = conn.query("SELECT * FROM pgline ORDER BY id").await?;

    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].get("id").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(rows[0].get("name").and_then(|v| v.as_str()), Some("Deez"));
    assert_eq!(rows[1].get("active").and_then(|v| v.as_bool()), Some(false));
    assert!(rows[2].get("name").is_some_and(|v| v.is_null()));

    for row in &rows {
        match row.to_json() {
            Ok(json) => println!("{json}"),
            Err(err) => tracing::error!("{err}"),
        }
    }

    // Streaming

    let mut stream = conn.fetch("SELECT * FROM pgline ORDER BY id");

    while let Some(row) = stream.next().await {
        let row = row?;
        tracing::info!("{row:?}");
    }

    let streamed = conn
        .query_with("SELECT name FROM pgline WHERE name IS NOT NULL", |row| {
            if let Some(name) = row.get("name").and_then(|v| v.as_str()) {
                tracing::info!("streamed {name}");
            }
        })
        .await?;

    assert_eq!(streamed, 2);

    // Errors

    let err = conn.execute("SELEC 1").await.unwrap_err();
    assert_eq!(err.as_database().map(|e| e.code()), Some("42601"));

    // connection is still usable
    conn.execute("SELECT 1").await?;

    conn.close().await;

    Ok(())
}

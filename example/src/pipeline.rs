use pgline::{Connection, Result};

pub async fn main() -> Result<()> {
    let conn = Connection::connect_env().await?;

    conn.execute("CREATE TEMP TABLE counter(n int)").await?;

    // every clone shares the same queue, commands run in issue order
    let mut handles = vec![];

    for i in 0..14 {
        let conn = conn.clone();
        handles.push(tokio::spawn(async move {
            conn.execute(format!("INSERT INTO counter(n) VALUES ({i})")).await
        }));
    }

    for handle in handles {
        handle.await.expect("task panicked")?;
    }

    // issued without awaiting in between, resolved in order
    let first = conn.query("SELECT count(*)::int AS total FROM counter");
    let bad = conn.execute("SELECT * FROM missing_table");
    let last = conn.query("SELECT max(n) AS max FROM counter");

    let total = first.await?;
    assert_eq!(total[0].get("total").and_then(|v| v.as_i64()), Some(14));
    assert!(bad.await.is_err());
    let max = last.await?;
    assert_eq!(max[0].get("max").and_then(|v| v.as_i64()), Some(13));

    // close drains, later commands are rejected
    let pending = conn.execute("SELECT pg_sleep(0.1)");
    let closed = conn.close();
    let rejected = conn.execute("SELECT 1");

    closed.await;
    pending.await?;
    assert!(rejected.await.unwrap_err().is_closed());

    Ok(())
}

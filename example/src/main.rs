use std::{sync::Arc, time::Duration};

use mariq::{
    ConnConfig, PoolConfig, PoolMap, QueryCallbacks, QueryConfig, ResultPayload, query_start,
};
use tokio::{runtime::Handle, sync::Notify};

#[tokio::main]
async fn main() -> mariq::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut pools = PoolMap::new();
    let pool = pools.register(
        PoolConfig::new("primary", ConnConfig::from_env())
            .capacity(2)
            .idle_timeout(Duration::from_secs(10)),
    )?;

    let done = Arc::new(Notify::new());

    let finished = done.clone();
    query_start(QueryConfig {
        pool: pool.clone(),
        handle: Handle::current(),
        statements: "CREATE TEMPORARY TABLE demo(id int, name text);\
            INSERT INTO demo VALUES (1,'foo'),(2,'bar');\
            SELECT * FROM demo"
            .into(),
        num_rs: 3,
        callbacks: QueryCallbacks {
            result_ready: Box::new(|_, result| {
                if let ResultPayload::ResultSet(rs) = &result.payload {
                    println!("result set: {} columns, {} affected", rs.columns, rs.affected_rows);
                }
            }),
            row_fetched: Box::new(|_, result| {
                if let ResultPayload::Row(row) = &result.payload {
                    println!("row: {:?}", row.values);
                }
            }),
            result_free: Box::new({
                let done = done.clone();
                move |_, result| {
                    if result.terminal {
                        done.notify_one();
                    }
                }
            }),
            error: Box::new(move |_, result| {
                eprintln!("query failed: {:?}", result.payload);
                finished.notify_one();
            }),
        },
        user_data: Vec::new(),
    })?;

    done.notified().await;

    // drain and shut down
    pools.signal_closing();
    pools.close_all_conns(&Handle::current());
    while !pools.check_all_conns_closed() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pools.deinit_all();

    Ok(())
}

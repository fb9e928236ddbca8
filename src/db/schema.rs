use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS blocks (
            hash           TEXT PRIMARY KEY,
            height         INTEGER NOT NULL,
            prev_hash      TEXT,
            timestamp      TEXT NOT NULL,
            size           INTEGER NOT NULL,
            weight         INTEGER NOT NULL,
            tx_count       INTEGER NOT NULL,
            fees_total     INTEGER NOT NULL,
            limited_detail INTEGER NOT NULL DEFAULT 0,
            created_at     TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS transactions (
            txid          TEXT PRIMARY KEY,
            block_hash    TEXT NOT NULL,
            block_height  INTEGER NOT NULL,
            position      INTEGER NOT NULL,
            input_count   INTEGER NOT NULL,
            output_count  INTEGER NOT NULL,
            input_value   INTEGER NOT NULL,
            output_value  INTEGER NOT NULL,
            fee           INTEGER NOT NULL,
            vsize         INTEGER NOT NULL,
            is_coinbase   INTEGER NOT NULL,
            created_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS signals (
            signal_id     TEXT PRIMARY KEY,
            signal_type   TEXT NOT NULL,
            block_height  INTEGER NOT NULL,
            confidence    REAL NOT NULL,
            metadata      TEXT NOT NULL, -- JSON
            created_at    TEXT NOT NULL,
            processed     INTEGER NOT NULL DEFAULT 0,
            processed_at  TEXT,
            is_predictive INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS entities (
            entity_id   TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            addresses   TEXT NOT NULL, -- JSON array
            metadata    TEXT NOT NULL, -- JSON object
            updated_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_blocks_height ON blocks(height);
        CREATE INDEX IF NOT EXISTS idx_blocks_created ON blocks(created_at);
        CREATE INDEX IF NOT EXISTS idx_transactions_block ON transactions(block_height);
        CREATE INDEX IF NOT EXISTS idx_transactions_created ON transactions(created_at);
        CREATE INDEX IF NOT EXISTS idx_signals_created ON signals(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_signals_type_height ON signals(signal_type, block_height);
        ",
    )?;
    Ok(())
}

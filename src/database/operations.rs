/// Database operations for storing monitoring session results
use crate::database::connection::execute_with_retry;
use crate::models::SessionRecord;

/// Create the session results table if it does not exist yet
pub async fn create_sessions_table(database_url: &str) -> Result<(), String> {
    execute_with_retry(database_url, |client| async move {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS oximeter_sessions(
                    id UUID PRIMARY KEY,
                    user_email TEXT NOT NULL,
                    spo2 DOUBLE PRECISION NOT NULL,
                    pulse DOUBLE PRECISION NOT NULL,
                    perfusion_index DOUBLE PRECISION NOT NULL,
                    timestamp_millis BIGINT NOT NULL
                )",
                &[],
            )
            .await
    })
    .await
}

/// Store one averaged monitoring session in the database
///
/// Uses the retry mechanism to handle transient database connection issues.
///
/// # Arguments
/// * `record` - Session result to store
/// * `database_url` - PostgreSQL connection string
///
/// # Returns
/// Result indicating success or failure
pub async fn store_session_record(record: &SessionRecord, database_url: &str) -> Result<(), String> {
    // Clone data for move into async closure
    let record = record.clone();

    execute_with_retry(database_url, move |client| {
        let record = record.clone();
        async move {
            client
                .execute(
                    "INSERT INTO oximeter_sessions(id, user_email, spo2, pulse, perfusion_index, timestamp_millis)
                     VALUES ($1, $2, $3, $4, $5, $6)",
                    &[
                        &record.id,
                        &record.user_email,
                        &record.spo2,
                        &record.pulse,
                        &record.perfusion_index,
                        &record.timestamp_millis,
                    ],
                )
                .await
        }
    })
    .await
}

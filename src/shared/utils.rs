use anyhow::Context;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sql_types::BigInt;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn create_conn() -> Result<DbPool, anyhow::Error> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder()
        .build(manager)
        .context("failed to create database pool")
}

#[derive(QueryableByName)]
struct NextTicketNumber {
    #[diesel(sql_type = BigInt)]
    n: i64,
}

/// Human-facing ticket numbers come from a dedicated sequence so they are
/// unique and strictly increasing even across concurrent creations.
pub fn next_ticket_number(conn: &mut PgConnection) -> QueryResult<i64> {
    diesel::sql_query("SELECT nextval('ticket_number_seq') AS n")
        .get_result::<NextTicketNumber>(conn)
        .map(|row| row.n)
}

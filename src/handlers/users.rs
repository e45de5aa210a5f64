//! User CRUD, including the `UserViewedPromotions` and
//! `UserRecentMailedAddresses` child tables (spec.md §3 Users, §4.4).

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::handlers::{in_transaction, read, HandlerContext};
use crate::models::User;

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        user_id: row.get("userId")?,
        username: row.get("username")?,
        email: row.get("email")?,
        viewed_promotions: Vec::new(),
        recent_mailed_addresses: Vec::new(),
    })
}

pub struct UserHandler {
    ctx: HandlerContext,
}

impl UserHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    pub async fn put(&self, user: User) -> Result<User> {
        let result = self
            .ctx
            .writer
            .submit(move |conn| {
                in_transaction(conn, |conn| {
                    conn.execute(
                        "INSERT INTO Users (userId, username, email) VALUES (?1, ?2, ?3)
                         ON CONFLICT(userId) DO UPDATE SET
                             username = excluded.username,
                             email = excluded.email",
                        params![user.user_id, user.username, user.email],
                    )?;

                    conn.execute(
                        "DELETE FROM UserViewedPromotions WHERE userId = ?1",
                        params![user.user_id],
                    )?;
                    for promotion in &user.viewed_promotions {
                        conn.execute(
                            "INSERT INTO UserViewedPromotions (userId, promotion) VALUES (?1, ?2)",
                            params![user.user_id, promotion],
                        )?;
                    }

                    conn.execute(
                        "DELETE FROM UserRecentMailedAddresses WHERE userId = ?1",
                        params![user.user_id],
                    )?;
                    for address in &user.recent_mailed_addresses {
                        conn.execute(
                            "INSERT INTO UserRecentMailedAddresses (userId, address) VALUES (?1, ?2)",
                            params![user.user_id, address],
                        )?;
                    }

                    Ok(user)
                })
            })
            .await?;

        // Not published through `Notifier` (spec.md §6 only lists entity
        // put/expunge events for notebooks/notes/resources/tags/searches);
        // the user row is single-account bookkeeping, not synced content.
        Ok(result)
    }

    pub async fn find_by_user_id(&self, user_id: i64) -> Result<Option<User>> {
        read(self.ctx.pool.clone(), move |conn| find_by(conn, user_id)).await
    }

    pub async fn expunge_by_user_id(&self, user_id: i64) -> Result<()> {
        self.ctx
            .writer
            .submit(move |conn| {
                conn.execute("DELETE FROM Users WHERE userId = ?1", params![user_id])?;
                Ok(())
            })
            .await
    }
}

fn find_by(connection: &Connection, user_id: i64) -> Result<Option<User>> {
    let mut user = match connection.query_row(
        "SELECT userId, username, email FROM Users WHERE userId = ?1",
        params![user_id],
        row_to_user,
    ) {
        Ok(user) => user,
        Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
        Err(other) => return Err(other.into()),
    };

    let mut promotions = connection.prepare(
        "SELECT promotion FROM UserViewedPromotions WHERE userId = ?1 ORDER BY promotion",
    )?;
    user.viewed_promotions = promotions
        .query_map(params![user_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    let mut addresses = connection.prepare(
        "SELECT address FROM UserRecentMailedAddresses WHERE userId = ?1 ORDER BY address",
    )?;
    user.recent_mailed_addresses = addresses
        .query_map(params![user_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    Ok(Some(user))
}

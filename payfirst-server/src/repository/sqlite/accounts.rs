//! Account, affiliate and commission storage for the SQLite repository.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;

use super::super::{
    Account, AccountDirectory, AccountId, AccountProfile, Affiliate, NewCommission,
    RepositoryError, REGISTRATION_FLOW_VERSION,
};
use super::{from_millis, sql_err, to_millis, SqliteRepository};

const ACCOUNT_COLUMNS: &str = "id, email, payment_id, display_name, national_id, phone, \
     address, member_type, external_customer_id, external_subscription_id, status, \
     registration_flow_version, payment_confirmed_at, created_at, updated_at";

struct AccountRow {
    id: String,
    email: String,
    payment_id: Option<String>,
    display_name: String,
    national_id: String,
    phone: String,
    address: String,
    member_type: String,
    external_customer_id: Option<String>,
    external_subscription_id: Option<String>,
    status: String,
    registration_flow_version: String,
    payment_confirmed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl AccountRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            payment_id: row.get(2)?,
            display_name: row.get(3)?,
            national_id: row.get(4)?,
            phone: row.get(5)?,
            address: row.get(6)?,
            member_type: row.get(7)?,
            external_customer_id: row.get(8)?,
            external_subscription_id: row.get(9)?,
            status: row.get(10)?,
            registration_flow_version: row.get(11)?,
            payment_confirmed_at: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn decode(self) -> Result<Account, RepositoryError> {
        Ok(Account {
            id: AccountId(self.id),
            email: self.email,
            payment_id: self.payment_id,
            display_name: self.display_name,
            national_id: self.national_id,
            phone: self.phone,
            address: serde_json::from_str(&self.address)
                .map_err(|_| RepositoryError::corruption("account address JSON"))?,
            member_type: self.member_type,
            external_customer_id: self.external_customer_id,
            external_subscription_id: self.external_subscription_id,
            status: self.status,
            registration_flow_version: self.registration_flow_version,
            payment_confirmed_at: self
                .payment_confirmed_at
                .map(|ms| from_millis(ms, "payment_confirmed_at"))
                .transpose()?,
            created_at: from_millis(self.created_at, "account created_at")?,
            updated_at: from_millis(self.updated_at, "account updated_at")?,
        })
    }
}

fn find_account_sync(
    conn: &Connection,
    operation: &'static str,
    filter: &str,
    value: &str,
) -> Result<Option<Account>, RepositoryError> {
    let row = conn
        .query_row(
            &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE {filter} LIMIT 1"),
            params![value],
            AccountRow::from_row,
        )
        .optional()
        .map_err(sql_err(operation))?;
    row.map(AccountRow::decode).transpose()
}

fn encode_address(address: &serde_json::Value) -> Result<String, RepositoryError> {
    serde_json::to_string(address)
        .map_err(|e| RepositoryError::storage("serialize address", e.to_string()))
}

#[async_trait]
impl AccountDirectory for SqliteRepository {
    async fn find_account_by_payment(
        &self,
        payment_id: &str,
    ) -> Result<Option<Account>, RepositoryError> {
        let payment_id = payment_id.to_string();
        self.with_conn("find account by payment", move |conn| {
            find_account_sync(conn, "find account by payment", "payment_id = ?1", &payment_id)
        })
        .await
    }

    async fn find_account_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Account>, RepositoryError> {
        let email = email.to_string();
        self.with_conn("find account by email", move |conn| {
            find_account_sync(conn, "find account by email", "email = ?1", &email)
        })
        .await
    }

    async fn create_account(&self, profile: &AccountProfile) -> Result<Account, RepositoryError> {
        let profile = profile.clone();
        let address = encode_address(&profile.address)?;
        self.with_conn("create account", move |conn| {
            let now = Utc::now();
            let id = AccountId::generate();
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO accounts (
                        id, email, credential, payment_id, display_name, national_id, phone,
                        address, member_type, external_customer_id, status,
                        registration_flow_version, payment_confirmed_at, created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'active', ?11, ?12, ?12, ?12)",
                    params![
                        id.0,
                        profile.email,
                        profile.credential,
                        profile.payment_id,
                        profile.display_name,
                        profile.national_id,
                        profile.phone,
                        address,
                        profile.member_type,
                        profile.external_customer_id,
                        REGISTRATION_FLOW_VERSION,
                        to_millis(now)
                    ],
                )
                .map_err(sql_err("create account"))?;

            if inserted == 0 {
                let existing =
                    find_account_sync(conn, "create account", "email = ?1", &profile.email)?
                        .ok_or_else(|| {
                            RepositoryError::storage("create account", "insert ignored without a conflicting row")
                        })?;
                return Err(RepositoryError::Conflict {
                    what: "account",
                    existing: existing.id.0,
                });
            }

            find_account_sync(conn, "create account", "id = ?1", &id.0)?
                .ok_or_else(|| RepositoryError::storage("create account", "account vanished"))
        })
        .await
    }

    async fn update_profile(
        &self,
        account_id: &AccountId,
        profile: &AccountProfile,
    ) -> Result<(), RepositoryError> {
        let account_id = account_id.0.clone();
        let profile = profile.clone();
        let address = encode_address(&profile.address)?;
        self.with_conn("update profile", move |conn| {
            let now = to_millis(Utc::now());
            let changed = conn
                .execute(
                    "UPDATE accounts SET
                        display_name = ?1, national_id = ?2, phone = ?3, address = ?4,
                        member_type = ?5,
                        external_customer_id = COALESCE(?6, external_customer_id),
                        payment_id = ?7, status = 'active', registration_flow_version = ?8,
                        payment_confirmed_at = COALESCE(payment_confirmed_at, ?9),
                        updated_at = ?9
                     WHERE id = ?10",
                    params![
                        profile.display_name,
                        profile.national_id,
                        profile.phone,
                        address,
                        profile.member_type,
                        profile.external_customer_id,
                        profile.payment_id,
                        REGISTRATION_FLOW_VERSION,
                        now,
                        account_id
                    ],
                )
                .map_err(sql_err("update profile"))?;
            if changed == 0 {
                return Err(RepositoryError::storage(
                    "update profile",
                    format!("no account {account_id}"),
                ));
            }
            Ok(())
        })
        .await
    }

    async fn link_subscription(
        &self,
        account_id: &AccountId,
        subscription_id: &str,
        payment_id: &str,
    ) -> Result<(), RepositoryError> {
        let account_id = account_id.0.clone();
        let subscription_id = subscription_id.to_string();
        let payment_id = payment_id.to_string();
        self.with_conn("link subscription", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE accounts SET external_subscription_id = ?1, payment_id = ?2,
                        updated_at = ?3
                     WHERE id = ?4",
                    params![subscription_id, payment_id, to_millis(Utc::now()), account_id],
                )
                .map_err(sql_err("link subscription"))?;
            if changed == 0 {
                return Err(RepositoryError::storage(
                    "link subscription",
                    format!("no account {account_id}"),
                ));
            }
            Ok(())
        })
        .await
    }

    async fn find_affiliate(
        &self,
        reference: &str,
    ) -> Result<Option<Affiliate>, RepositoryError> {
        let reference = reference.to_string();
        self.with_conn("find affiliate", move |conn| {
            let row: Option<(String, String, Option<String>)> = conn
                .query_row(
                    "SELECT id, code, commission_percentage FROM affiliates
                     WHERE id = ?1 OR code = ?1 LIMIT 1",
                    params![reference],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(sql_err("find affiliate"))?;

            row.map(|(id, code, percentage)| {
                let commission_percentage = percentage
                    .map(|p| {
                        Decimal::from_str(&p)
                            .map_err(|_| RepositoryError::corruption("commission percentage"))
                    })
                    .transpose()?;
                Ok(Affiliate {
                    id,
                    code,
                    commission_percentage,
                })
            })
            .transpose()
        })
        .await
    }

    async fn upsert_affiliate(&self, affiliate: &Affiliate) -> Result<(), RepositoryError> {
        let affiliate = affiliate.clone();
        self.with_conn("upsert affiliate", move |conn| {
            conn.execute(
                "INSERT INTO affiliates (id, code, commission_percentage) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                     code = excluded.code,
                     commission_percentage = excluded.commission_percentage",
                params![
                    affiliate.id,
                    affiliate.code,
                    affiliate.commission_percentage.map(|p| p.to_string())
                ],
            )
            .map_err(sql_err("upsert affiliate"))?;
            Ok(())
        })
        .await
    }

    async fn record_commission(
        &self,
        commission: &NewCommission,
    ) -> Result<bool, RepositoryError> {
        let commission = commission.clone();
        self.with_conn("record commission", move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO commissions
                        (payment_id, affiliate_id, account_id, amount, percentage, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        commission.payment_id,
                        commission.affiliate_id,
                        commission.account_id.0,
                        commission.amount.to_string(),
                        commission.percentage.to_string(),
                        to_millis(Utc::now())
                    ],
                )
                .map_err(sql_err("record commission"))?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn count_commissions(&self, payment_id: &str) -> Result<usize, RepositoryError> {
        let payment_id = payment_id.to_string();
        self.with_conn("count commissions", move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM commissions WHERE payment_id = ?1",
                    params![payment_id],
                    |row| row.get(0),
                )
                .map_err(sql_err("count commissions"))?;
            usize::try_from(count).map_err(|_| RepositoryError::corruption("commission count"))
        })
        .await
    }
}

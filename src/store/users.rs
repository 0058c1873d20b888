//-
// Copyright (c) 2020, 2026, Jason Lingle
//
// This file is part of Rookery.
//
// Rookery is free software: you can redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Rookery is distributed in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Rookery. If not, see <http://www.gnu.org/licenses/>.

use rusqlite::OptionalExtension as _;

use super::{
    mailboxes::ensure_mailbox, map_conflict, types::*, ConnectionExt as _,
    Store, DEFAULT_MAILBOXES,
};
use crate::support::{error::Error, password};

/// Addresses are compared case-insensitively throughout; they are stored
/// lowercased.
pub fn normalise_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

impl Store {
    /// Create a user along with the standard mailboxes.
    ///
    /// `password_hash` must already be hashed. A quota of 0 is unlimited.
    pub fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        role: Role,
        quota_bytes: u64,
    ) -> Result<User, Error> {
        let email = normalise_email(email);
        match email.split_once('@') {
            Some((local, domain))
                if !local.is_empty() && !domain.is_empty() => {},
            _ => {
                return Err(Error::ValidationFailed(format!(
                    "bad email address {email:?}"
                )))
            },
        }

        let now = UnixTimestamp::now();
        let mut cxn = self.cxn();
        let txn = cxn.write_tx()?;
        txn.execute(
            "INSERT INTO `users` (\
               `email`, `password_hash`, `role`, `quota_bytes`, `created_at`\
             ) VALUES (?, ?, ?, ?, ?)",
            (&email, password_hash, role, quota_bytes as i64, now),
        )
        .map_err(map_conflict)?;

        for mailbox in DEFAULT_MAILBOXES {
            ensure_mailbox(&txn, &email, mailbox)?;
        }

        txn.commit()?;

        Ok(User {
            email,
            password_hash: password_hash.to_owned(),
            role,
            quota_bytes,
            used_bytes: 0,
            created_at: now,
            last_login_at: None,
        })
    }

    pub fn find_user(&self, email: &str) -> Result<User, Error> {
        self.cxn()
            .prepare_cached("SELECT * FROM `users` WHERE `email` = ?")?
            .query_row((normalise_email(email),), from_row)
            .optional()?
            .ok_or(Error::NotFound)
    }

    pub fn user_exists(&self, email: &str) -> Result<bool, Error> {
        Ok(self
            .cxn()
            .prepare_cached("SELECT 1 FROM `users` WHERE `email` = ?")?
            .exists((normalise_email(email),))?)
    }

    pub fn list_users(&self) -> Result<Vec<User>, Error> {
        self.cxn()
            .prepare("SELECT * FROM `users` ORDER BY `email`")?
            .query_map((), from_row)?
            .collect::<Result<Vec<User>, _>>()
            .map_err(Into::into)
    }

    /// Check `password` for `email`, recording the login time on success.
    ///
    /// Unknown users and wrong passwords are indistinguishable to the caller.
    pub fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> Result<User, Error> {
        let mut user = match self.find_user(email) {
            Ok(user) => user,
            Err(Error::NotFound) => return Err(Error::InvalidCredentials),
            Err(e) => return Err(e),
        };

        // Hash verification is slow; the connection is not held meanwhile.
        if !password::verify(&user.password_hash, password) {
            return Err(Error::InvalidCredentials);
        }

        let now = UnixTimestamp::now();
        self.cxn().execute(
            "UPDATE `users` SET `last_login_at` = ? WHERE `email` = ?",
            (now, &user.email),
        )?;
        user.last_login_at = Some(now);
        Ok(user)
    }

    pub fn set_password(
        &self,
        email: &str,
        password_hash: &str,
    ) -> Result<(), Error> {
        let updated = self.cxn().execute(
            "UPDATE `users` SET `password_hash` = ? WHERE `email` = ?",
            (password_hash, normalise_email(email)),
        )?;
        if 0 == updated {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    pub fn set_quota(
        &self,
        email: &str,
        quota_bytes: u64,
    ) -> Result<(), Error> {
        let updated = self.cxn().execute(
            "UPDATE `users` SET `quota_bytes` = ? WHERE `email` = ?",
            (quota_bytes as i64, normalise_email(email)),
        )?;
        if 0 == updated {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    pub fn add_domain(&self, name: &str) -> Result<(), Error> {
        self.cxn()
            .execute(
                "INSERT INTO `domains` (`name`, `created_at`) VALUES (?, ?)",
                (name.to_ascii_lowercase(), UnixTimestamp::now()),
            )
            .map_err(map_conflict)?;
        Ok(())
    }

    /// Whether `name` is an active domain registered with `add_domain`.
    ///
    /// The primary domain of the server is not necessarily registered here;
    /// callers check it separately.
    pub fn is_local_domain(&self, name: &str) -> Result<bool, Error> {
        Ok(self
            .cxn()
            .prepare_cached(
                "SELECT 1 FROM `domains` WHERE `name` = ? AND `active`",
            )?
            .exists((name.to_ascii_lowercase(),))?)
    }

    pub fn list_domains(&self) -> Result<Vec<String>, Error> {
        self.cxn()
            .prepare("SELECT `name` FROM `domains` ORDER BY `name`")?
            .query_map((), from_single)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(Into::into)
    }

    /// Record a received SMTP TLS report (RFC 8460) verbatim.
    pub fn save_tls_report(
        &self,
        organization: &str,
        domain: &str,
        start_at: UnixTimestamp,
        end_at: UnixTimestamp,
        report: &str,
    ) -> Result<(), Error> {
        self.cxn().execute(
            "INSERT INTO `tls_reports` (\
               `organization`, `domain`, `start_at`, `end_at`, `report`, \
               `received_at`\
             ) VALUES (?, ?, ?, ?, ?, ?)",
            (
                organization,
                domain,
                start_at,
                end_at,
                report,
                UnixTimestamp::now(),
            ),
        )?;
        Ok(())
    }

    pub fn count_tls_reports(&self, domain: &str) -> Result<u32, Error> {
        Ok(self.cxn().query_row(
            "SELECT COUNT(*) FROM `tls_reports` WHERE `domain` = ?",
            (domain,),
            from_single,
        )?)
    }
}

#[cfg(test)]
mod test {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn user_lifecycle() {
        let ts = test_store();
        let hash = password::hash("hunter2").unwrap();
        let user = ts
            .create_user("Alice@Example.COM", &hash, Role::Admin, 0)
            .unwrap();
        assert_eq!("alice@example.com", user.email);

        assert_matches!(
            Err(Error::AlreadyExists),
            ts.create_user("alice@example.com", &hash, Role::User, 0)
        );
        assert_matches!(
            Err(Error::ValidationFailed(..)),
            ts.create_user("nobody", &hash, Role::User, 0)
        );

        assert!(ts.user_exists("ALICE@example.com").unwrap());
        assert_eq!(
            Role::Admin,
            ts.find_user("alice@example.com").unwrap().role
        );
        assert_eq!(5, ts.list_mailboxes("alice@example.com").unwrap().len());

        assert_matches!(
            Err(Error::InvalidCredentials),
            ts.authenticate("alice@example.com", "hunter3")
        );
        assert_matches!(
            Err(Error::InvalidCredentials),
            ts.authenticate("bob@example.com", "hunter2")
        );
        let authed = ts.authenticate("alice@example.com", "hunter2").unwrap();
        assert!(authed.last_login_at.is_some());
        assert!(ts
            .find_user("alice@example.com")
            .unwrap()
            .last_login_at
            .is_some());

        ts.set_password("alice@example.com", &password::hash("new").unwrap())
            .unwrap();
        ts.authenticate("alice@example.com", "new").unwrap();
        assert_matches!(
            Err(Error::NotFound),
            ts.set_password("bob@example.com", "x")
        );

        ts.set_quota("alice@example.com", 1024).unwrap();
        assert_eq!(
            1024,
            ts.find_user("alice@example.com").unwrap().quota_bytes
        );
        assert_eq!(1, ts.list_users().unwrap().len());
    }

    #[test]
    fn domains() {
        let ts = test_store();
        ts.add_domain("Example.ORG").unwrap();
        assert_matches!(
            Err(Error::AlreadyExists),
            ts.add_domain("example.org")
        );
        assert!(ts.is_local_domain("EXAMPLE.org").unwrap());
        assert!(!ts.is_local_domain("example.net").unwrap());
        assert_eq!(vec!["example.org"], ts.list_domains().unwrap());
    }

    #[test]
    fn tls_reports() {
        let ts = test_store();
        let now = UnixTimestamp::now();
        ts.save_tls_report(
            "Example Org",
            "local",
            now - chrono::Duration::days(1),
            now,
            "{}",
        )
        .unwrap();
        assert_eq!(1, ts.count_tls_reports("local").unwrap());
    }
}

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

use super::main::{open_store, UserAddSubcommand, UserPasswdSubcommand};
use crate::store::Role;
use crate::support::{
    password, sysexits::Sysexit, system_config::SystemConfig,
};

const GENERATED_PASSWORD_LEN: usize = 16;

pub(super) fn add(cmd: UserAddSubcommand, config: SystemConfig) {
    let store = open_store(&config);

    let password = if cmd.prompt_password {
        prompt_new_password()
    } else {
        password::generate(GENERATED_PASSWORD_LEN)
    };

    let hash = match password::hash(&password) {
        Ok(hash) => hash,
        Err(e) => die!(EX_SOFTWARE, "Failed to hash password: {}", e),
    };

    let role = if cmd.admin { Role::Admin } else { Role::User };
    match store.create_user(&cmd.email, &hash, role, config.imap.default_quota)
    {
        Ok(user) => {
            println!("Created {} user {}", user.role, user.email);
        },
        Err(e) => {
            eprintln!("Failed to create user '{}': {}", cmd.email, e);
            Sysexit::from(&e).exit();
        },
    }

    if !cmd.prompt_password {
        println!("Password: {}", password);
    }
}

pub(super) fn passwd(cmd: UserPasswdSubcommand, config: SystemConfig) {
    let store = open_store(&config);

    // Check first so that nobody types a password in for nothing.
    match store.user_exists(&cmd.email) {
        Ok(true) => (),
        Ok(false) => die!(EX_NOUSER, "No such user: {}", cmd.email),
        Err(e) => die!(EX_UNAVAILABLE, "Failed to look up user: {}", e),
    }

    let password = prompt_new_password();
    let hash = match password::hash(&password) {
        Ok(hash) => hash,
        Err(e) => die!(EX_SOFTWARE, "Failed to hash password: {}", e),
    };

    if let Err(e) = store.set_password(&cmd.email, &hash) {
        eprintln!("Failed to change password: {}", e);
        Sysexit::from(&e).exit();
    }

    println!("Password changed");
}

fn prompt_new_password() -> String {
    match rpassword::prompt_password("Password: ")
        .and_then(|a| rpassword::prompt_password("Confirm: ").map(|b| (a, b)))
    {
        Err(e) => die!(EX_NOINPUT, "Failed to read password: {}", e),
        Ok((a, b)) if a != b => die!(EX_DATAERR, "Passwords don't match"),
        Ok((a, _)) if a.is_empty() => die!(EX_NOINPUT, "No password given"),
        Ok((a, _)) => a,
    }
}

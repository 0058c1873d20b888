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

use std::fs;
use std::path::{Path, PathBuf};

use structopt::StructOpt;

use crate::store::Store;
use crate::support::log_prefix::LogPrefix;
use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Run every listener and the delivery workers until signalled.
    ///
    /// SMTP, IMAP, ManageSieve and the HTTP API are all served from this
    /// one process. SIGINT or SIGTERM stops accepting new connections;
    /// sessions already in progress get 30 seconds to finish.
    Serve(CommonOptions),
    /// Manage user accounts.
    User(UserSubcommand),
    /// Inspect the outbound queue.
    Queue(QueueSubcommand),
    /// Generate the DKIM signing key and print the DNS record to publish.
    ///
    /// The key is written to the path configured as `dkim.private_key`. An
    /// existing key is never overwritten.
    DkimKeygen(CommonOptions),
    /// Copy the database and the blob tree into a new backup directory.
    ///
    /// The copy is taken while the server runs. The path of the new
    /// directory is printed on success.
    Backup(BackupSubcommand),
}

#[derive(StructOpt)]
pub(super) struct CommonOptions {
    /// The directory containing `rookery.toml` etc
    /// [default: /etc/rookery or /usr/local/etc/rookery]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

#[derive(StructOpt)]
enum UserSubcommand {
    /// Create a new user account.
    Add(UserAddSubcommand),
    /// Replace a user's password.
    Passwd(UserPasswdSubcommand),
}

#[derive(StructOpt)]
pub(super) struct UserAddSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// Give the user the admin role.
    #[structopt(long)]
    pub(super) admin: bool,

    /// Prompt for the password instead of generating one.
    #[structopt(long)]
    pub(super) prompt_password: bool,

    /// The email address of the user to create.
    pub(super) email: String,
}

#[derive(StructOpt)]
pub(super) struct UserPasswdSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// The email address of the user whose password is to be changed.
    pub(super) email: String,
}

#[derive(StructOpt)]
pub(super) struct BackupSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// Where to create the backup directory, instead of `backup.location`.
    #[structopt(long, parse(from_os_str))]
    pub(super) location: Option<PathBuf>,
}

#[derive(StructOpt)]
enum QueueSubcommand {
    /// List every row of the outbound queue, oldest first.
    List(CommonOptions),
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        },
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        },
    });

    match cmd {
        Command::Serve(common) => {
            let (root, config) = load_config(&common);
            init_log(&root);
            super::serve::serve(config);
        },
        Command::User(UserSubcommand::Add(cmd)) => {
            let (_, config) = load_config(&cmd.common);
            crate::init_simple_log();
            super::user::add(cmd, config);
        },
        Command::User(UserSubcommand::Passwd(cmd)) => {
            let (_, config) = load_config(&cmd.common);
            crate::init_simple_log();
            super::user::passwd(cmd, config);
        },
        Command::Queue(QueueSubcommand::List(common)) => {
            let (_, config) = load_config(&common);
            crate::init_simple_log();
            super::queue::list(config);
        },
        Command::DkimKeygen(common) => {
            let (_, config) = load_config(&common);
            crate::init_simple_log();
            super::dkim::keygen(config);
        },
        Command::Backup(cmd) => {
            let (_, config) = load_config(&cmd.common);
            crate::init_simple_log();
            super::backup::backup(cmd, config);
        },
    }
}

/// Locate the system root and load `rookery.toml` from it, exiting with
/// `EX_CONFIG` if anything is wrong.
fn load_config(common: &CommonOptions) -> (PathBuf, SystemConfig) {
    let root = common.root.clone().unwrap_or_else(|| {
        if Path::new("/etc/rookery/rookery.toml").is_file() {
            "/etc/rookery".to_owned().into()
        } else if Path::new("/usr/local/etc/rookery/rookery.toml").is_file() {
            "/usr/local/etc/rookery".to_owned().into()
        } else {
            eprintln!(
                "Neither /etc/rookery nor /usr/local/etc/rookery looks like\n\
                 the Rookery root; use --root=/path/to/rookery if your\n\
                 installation is elsewhere."
            );
            EX_CONFIG.exit()
        }
    });

    let system_config_path = root.join("rookery.toml");
    let system_config_toml = match fs::read_to_string(&system_config_path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!(
                "Error reading '{}': {}",
                system_config_path.display(),
                e
            );
            EX_CONFIG.exit()
        },
    };

    let mut system_config: SystemConfig =
        match toml::from_str(&system_config_toml) {
            Ok(config) => config,
            Err(e) => {
                eprintln!(
                    "Error in config file at '{}': {}",
                    system_config_path.display(),
                    e
                );
                EX_CONFIG.exit()
            },
        };

    if let Err(e) = system_config.validate() {
        eprintln!(
            "Invalid configuration in '{}': {}",
            system_config_path.display(),
            e
        );
        EX_CONFIG.exit();
    }

    system_config.resolve_paths(&root);
    (root, system_config)
}

fn init_log(root: &Path) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        crate::init_simple_log();
        return;
    }

    // log4rs when configured, otherwise syslog.
    let log_config_file = root.join("logging.toml");
    if log_config_file.is_file() {
        if let Err(e) = log4rs::init_file(
            &log_config_file,
            log4rs::file::Deserializers::new(),
        ) {
            eprintln!(
                "Failed to initialise logging from '{}': {}",
                log_config_file.display(),
                e
            );
            EX_CONFIG.exit();
        }
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: env!("CARGO_PKG_NAME").to_owned(),
            pid: nix::unistd::getpid().as_raw(),
        };

        match syslog::unix(formatter) {
            Ok(logger) => {
                if log::set_boxed_logger(Box::new(syslog::BasicLogger::new(
                    logger,
                )))
                .map(|_| log::set_max_level(log::LevelFilter::Info))
                .is_err()
                {
                    eprintln!("A logger was already installed");
                    EX_SOFTWARE.exit();
                }
            },
            Err(e) => {
                eprintln!("Failed to connect to syslog: {}", e);
                EX_UNAVAILABLE.exit();
            },
        }
    }
}

/// Open the store named by `config`, exiting if that is not possible.
pub(super) fn open_store(config: &SystemConfig) -> Store {
    match Store::open(
        &LogPrefix::new("store".to_owned()),
        &config.storage.db_path,
        &config.storage.blob_path,
    ) {
        Ok(store) => store,
        Err(e) => die!(
            EX_UNAVAILABLE,
            "Unable to open store at '{}': {}",
            config.storage.db_path.display(),
            e
        ),
    }
}

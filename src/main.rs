use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info, warn};

use mailbackup::config::{CliOverrides, Config, DEFAULT_CONF_FILE};
use mailbackup::credentials::{self, CredentialManager};
use mailbackup::shutdown::Shutdown;
use mailbackup::{imap_session, logging, Runner};

/// Back up IMAP mailboxes to local .eml files
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Config file path
    #[clap(short = 'c', long, default_value = DEFAULT_CONF_FILE)]
    conf_file: String,

    /// Log file (console logging is off unless --log-print is given)
    #[clap(short = 'f', long)]
    log_file: Option<String>,

    /// Set log level
    #[clap(short = 'l', long, value_parser = ["debug", "info", "warning", "error"])]
    log_level: Option<String>,

    /// Print log output to console too (standard if no log file was specified)
    #[clap(short = 'p', long)]
    log_print: bool,

    /// Secret IMAP password
    #[clap(short = 's', long)]
    imap_password: Option<String>,

    /// Do not ask before deleting backed up messages on the server
    #[clap(short = 'y', long)]
    yes: bool,

    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store the IMAP password of the configured account in the system keyring
    StorePassword,

    /// Remove the IMAP password of the configured account from the system keyring
    ForgetPassword,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let conf_file = Config::locate(&args.conf_file);
    let mut config = Config::load(&conf_file)?;
    config.apply_cli(CliOverrides {
        log_file: args.log_file,
        log_level: args.log_level,
        log_print: args.log_print,
        imap_password: args.imap_password,
    });

    logging::init(&config).context("Failed to initialize logging")?;
    debug!("config = {:?}", config.redacted());

    let manager = CredentialManager::new();
    if let Some(cmd) = args.command {
        match cmd {
            Commands::StorePassword => {
                let password = credentials::prompt_password(&config.imap_username)?;
                manager.store_password(&config.imap_username, &password)?;
                println!("Password stored for {}", config.imap_username);
            }
            Commands::ForgetPassword => {
                manager.delete_password(&config.imap_username)?;
                println!("Password removed for {}", config.imap_username);
            }
        }
        return Ok(());
    }

    if config.delete && !args.yes && !confirm_delete()? {
        info!("Please check your mail-backup.yaml and run again.");
        return Ok(());
    }

    let password = credentials::resolve_password(&config, &manager)?;

    // Installed after the prompts so Ctrl-C still aborts them
    let shutdown = Shutdown::install().context("Failed to install signal handlers")?;
    let mut source = imap_session::connect(&config, &password)?;

    let mut runner = Runner::new(config, shutdown);
    let result = runner.run(source.as_mut());

    if let Err(e) = source.logout() {
        warn!("Logout failed: {}", e);
    }
    result?;

    Ok(())
}

fn confirm_delete() -> Result<bool> {
    print!("Are you sure you want to delete downloaded messages on the server? (y/n) ");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read answer")?;

    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

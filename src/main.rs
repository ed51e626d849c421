//! keyman CLI application.
//!
//! This binary provides a command-line interface for registering SSH key pairs and
//! switching which one the SSH client uses as its default identity.

use clap::{Parser, Subcommand};
use keyman::config::{Config, Overrides};
use keyman::engine::activation::{
    add_key, current_key, deactivate, list_keys, relink, remove_key, rename_key, show_key,
    switch_key,
};
use keyman::error::Result;
use keyman::storage::keystore::KeyStore;
use keyman::storage::metadata::KeyPair;
use keyman::storage::slot::SlotMode;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "keyman", version)]
#[command(about = "SSH key manager for easily swapping your SSH keys around", long_about = None)]
struct Cli {
    /// Directory holding the key registry (default: ~/.keyman)
    #[arg(long, global = true, value_name = "DIR")]
    store_dir: Option<PathBuf>,

    /// SSH directory containing the active identity (default: ~/.ssh)
    #[arg(long, global = true, value_name = "DIR")]
    ssh_dir: Option<PathBuf>,

    /// File name of the active identity inside the SSH directory (default: id_rsa)
    #[arg(long, global = true)]
    identity: Option<String>,

    /// How keys are placed into the SSH directory
    #[arg(long, global = true, value_enum)]
    mode: Option<SlotMode>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an existing private key
    #[command(alias = "new", arg_required_else_help = true)]
    Add {
        /// Path to the private key file
        #[arg(value_name = "PRIVATE_KEY_PATH")]
        private_key: PathBuf,

        /// Name to identify the key by (default: the file name)
        #[arg(short, long, alias = "save-as")]
        name: Option<String>,

        /// Path to the public key file (default: PRIVATE_KEY_PATH.pub if present)
        #[arg(short, long)]
        public: Option<PathBuf>,

        /// Switch to the key right after adding it
        #[arg(short, long = "use")]
        use_key: bool,
    },

    /// Make a key the active SSH identity
    #[command(aliases = ["use", "swap"])]
    Switch {
        /// Key name
        key_name: String,
    },

    /// Remove a key from the registry
    #[command(alias = "rm")]
    Remove {
        /// Key name
        key_name: String,

        /// Also delete the private and public key files
        #[arg(long)]
        destructive: bool,
    },

    /// List all keys
    #[command(alias = "ls")]
    List,

    /// Show the active key
    Current,

    /// Show details of a key, or of the active key
    #[command(alias = "info")]
    Show {
        /// Key name (default: the active key)
        key_name: Option<String>,
    },

    /// Rename a key
    #[command(alias = "mv")]
    Rename {
        /// Current key name
        key_name: String,

        /// New key name
        new_name: String,
    },

    /// Stop using the active key and clear it from the SSH directory
    Deactivate,

    /// Place the active key into the SSH directory again
    Relink,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error[{}]: {}", err.kind(), err);
            ExitCode::from(err.exit_code())
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose { "debug" } else { "warn" };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::resolve(Overrides {
        store_dir: cli.store_dir,
        ssh_dir: cli.ssh_dir,
        identity: cli.identity,
        mode: cli.mode,
    })?;
    let store = config.open_store();

    match cli.command {
        Commands::Add {
            private_key,
            name,
            public,
            use_key,
        } => {
            let key = add_key(&store, name.as_deref(), &private_key, public.as_deref())?;
            println!("Added key '{}'", key.name);

            if use_key {
                switch_key(&store, &key.name)?;
                println!("Now using key '{}'", key.name);
            } else {
                println!("Use it with `keyman switch {}`", key.name);
            }

            Ok(())
        }

        Commands::Switch { key_name } => {
            let key = switch_key(&store, &key_name)?;
            println!(
                "Now using key '{}' as {}",
                key.name,
                store.slot().private_path().display()
            );

            Ok(())
        }

        Commands::Remove {
            key_name,
            destructive,
        } => {
            let key = remove_key(&store, &key_name, destructive)?;

            if destructive {
                println!("Removed key '{}' and deleted its files", key.name);
            } else {
                println!(
                    "Removed key '{}' (files left at {})",
                    key.name,
                    key.private_path.display()
                );
            }

            Ok(())
        }

        Commands::List => {
            let keys = list_keys(&store)?;

            if keys.is_empty() {
                println!("No keys registered. Add one with `keyman add <PRIVATE_KEY_PATH>`.");
            } else {
                println!("  {:<20} {:<50} Added", "Name", "Private Key");
                println!("{}", "-".repeat(92));

                for (key, active) in keys.iter() {
                    println!(
                        "{} {:<20} {:<50} {}",
                        if active { "*" } else { " " },
                        key.name,
                        key.private_path.display(),
                        format_timestamp(key.added_at)
                    );
                }
            }

            Ok(())
        }

        Commands::Current => {
            match current_key(&store)? {
                Some(key) => {
                    println!("{}", key.name);
                    warn_if_out_of_sync(&store, &key);
                }
                None => println!("No key is active."),
            }

            Ok(())
        }

        Commands::Show { key_name } => {
            match show_key(&store, key_name.as_deref())? {
                Some(key) => print_key(&store, &key),
                None => println!("No key is active. Name a key: `keyman show <KEY_NAME>`."),
            }

            Ok(())
        }

        Commands::Rename { key_name, new_name } => {
            let key = rename_key(&store, &key_name, &new_name)?;
            println!("Renamed key: {} -> {}", key_name, key.name);

            Ok(())
        }

        Commands::Deactivate => {
            match deactivate(&store)? {
                Some(key) => println!("Stopped using key '{}'", key.name),
                None => println!("No key is active."),
            }

            Ok(())
        }

        Commands::Relink => {
            match relink(&store)? {
                Some(key) => println!(
                    "Placed key '{}' at {}",
                    key.name,
                    store.slot().private_path().display()
                ),
                None => println!("No key is active."),
            }

            Ok(())
        }
    }
}

fn print_key(store: &KeyStore, key: &KeyPair) {
    let active = current_key(store)
        .ok()
        .flatten()
        .is_some_and(|current| current.name == key.name);

    println!("Key '{}'{}:", key.name, if active { " (in use)" } else { "" });
    println!("  Private Key: {}", key.private_path.display());
    if let Some(public) = &key.public_path {
        println!("  Public Key:  {}", public.display());
    }
    println!("  Added:       {}", format_timestamp(key.added_at));

    if active {
        warn_if_out_of_sync(store, key);
    }
}

fn warn_if_out_of_sync(store: &KeyStore, key: &KeyPair) {
    if !store.slot().holds(key) {
        eprintln!(
            "warning: {} does not hold '{}'; run `keyman relink` to restore it",
            store.slot().private_path().display(),
            key.name
        );
    }
}

fn format_timestamp(secs: u64) -> String {
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

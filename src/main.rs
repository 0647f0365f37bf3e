mod audit;
mod categorizer;
mod cli;
mod connections;
mod db;
mod error;
mod fmt;
mod importer;
mod logging;
mod models;
mod reconciler;
mod resolver;
mod scheduler;
mod scrapers;
mod settings;
mod sync;

use clap::Parser;

use cli::{AccountsCommands, Cli, Commands, ConnectionsCommands, RulesCommands};

fn main() {
    let cli = Cli::parse();

    let mut log_settings = settings::load_settings();
    if !cli.verbose && !matches!(cli.command, Commands::Schedule) {
        log_settings.log_level = "warn".to_string();
    }
    logging::init(&log_settings);

    if let Err(e) = dispatch(cli.command) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn dispatch(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init { data_dir } => cli::init::run(data_dir)?,
        Commands::Accounts { command } => match command {
            AccountsCommands::Add {
                name,
                account_type,
                institution,
                number,
            } => cli::accounts::add(&name, &account_type, institution.as_deref(), number.as_deref())?,
            AccountsCommands::List => cli::accounts::list()?,
        },
        Commands::Connections { command } => match command {
            ConnectionsCommands::Add {
                name,
                scraper,
                username,
                password_stdin,
                date_format,
                track_offset,
                only,
                fixture,
            } => cli::connections::add(cli::connections::AddArgs {
                name,
                scraper,
                username,
                password_stdin,
                date_format,
                track_offset,
                only,
                fixture,
            })?,
            ConnectionsCommands::List => cli::connections::list()?,
            ConnectionsCommands::Show { connection } => cli::connections::show(&connection)?,
            ConnectionsCommands::Map {
                connection,
                remote,
                account,
            } => cli::connections::map(&connection, &remote, &account)?,
            ConnectionsCommands::Unmap { connection, remote } => cli::connections::unmap(&connection, &remote)?,
            ConnectionsCommands::Schedule {
                connection,
                frequency,
                at,
                timezone,
            } => cli::connections::schedule(&connection, &frequency, at.as_deref(), &timezone)?,
            ConnectionsCommands::Configure {
                connection,
                track_offset,
                only,
                all_accounts,
                fixture,
            } => cli::connections::configure(&connection, track_offset, only, all_accounts, fixture)?,
            ConnectionsCommands::Remove { connection } => cli::connections::remove(&connection)?,
            ConnectionsCommands::Test { connection, bind } => cli::connections::test(&connection, bind)?,
        },
        Commands::Sync { connection, all } => cli::sync::run(connection.as_deref(), all)?,
        Commands::Schedule => cli::schedule::run()?,
        Commands::Import {
            file,
            format,
            date_format,
            account,
            create_accounts,
            force,
        } => cli::import::run(cli::import::ImportArgs {
            file,
            format,
            date_format,
            account,
            create_accounts,
            force,
        })?,
        Commands::Rules { command } => match command {
            RulesCommands::Add {
                name,
                category,
                conditions,
                priority,
            } => cli::rules::add(&name, &category, &conditions, priority)?,
            RulesCommands::List => cli::rules::list()?,
            RulesCommands::Delete { id } => cli::rules::delete(id)?,
        },
        Commands::Categorize => cli::categorize::run()?,
        Commands::Transactions {
            account,
            uncategorized,
            limit,
        } => cli::transactions::run(account.as_deref(), uncategorized, limit)?,
        Commands::Audit { connection, limit } => cli::audit::run(&connection, limit)?,
        Commands::Status => cli::status::run()?,
        Commands::Backup { output } => cli::backup::run(output)?,
    }
    Ok(())
}

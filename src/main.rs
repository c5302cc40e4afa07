use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use msgauth::config::Config;
use msgauth::delivery::ProgramDelivery;
use msgauth::entry::{self, CLEAN_CONFIG_FAILURE, CONFIRM_CONFIG_FAILURE, MAIL_CONFIG_FAILURE};
use msgauth::logging::{self, log_fatal};
use std::io::{self, Read};
use std::path::PathBuf;
use std::process;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Mail,
    Confirm,
    Clean,
}

impl Role {
    fn config_failure_code(self) -> i32 {
        match self {
            Role::Mail => MAIL_CONFIG_FAILURE,
            Role::Confirm => CONFIRM_CONFIG_FAILURE,
            Role::Clean => CLEAN_CONFIG_FAILURE,
        }
    }
}

fn cli() -> Command {
    Command::new("msgauth")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Authenticates mailing-list confirmation notices with one-time tokens")
        .long_about(
            "msgauth stamps outbound mail for configured list addresses with a\n\
             one-time token, and answers a list manager's confirmation notice\n\
             automatically when it quotes one of those tokens back.",
        )
        .arg(
            Arg::new("dir")
                .short('d')
                .long("dir")
                .value_name("DIR")
                .help("Configuration directory (default: $MSGAUTH_DIR or ~/.msgauth)")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write a default configuration file")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Load and check the configuration, then exit")
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new("mail")
                .about("Read a message on stdin, stamp it if needed and send it on")
                .disable_help_flag(true)
                .arg(
                    Arg::new("args")
                        .value_name("ARGS")
                        .help("Passed through to the delivery program; a leading `--` is not forwarded")
                        .num_args(0..)
                        .trailing_var_arg(true)
                        .allow_hyphen_values(true)
                        .action(ArgAction::Append),
                ),
        )
        .subcommand(
            Command::new("confirm")
                .about("Read a message on stdin; exit 99 if it was a confirmation notice we answered"),
        )
        .subcommand(Command::new("clean").about("Remove expired tokens"))
}

fn main() {
    let matches = cli().get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let dir = matches
        .get_one::<String>("dir")
        .map(PathBuf::from)
        .unwrap_or_else(Config::dir_from_env);

    if matches.get_flag("test-config") {
        logging::init_fallback();
        test_config(&dir);
        return;
    }

    let (role, sub) = match matches.subcommand() {
        Some(("mail", sub)) => (Role::Mail, sub),
        Some(("confirm", sub)) => (Role::Confirm, sub),
        Some(("clean", sub)) => (Role::Clean, sub),
        _ => {
            eprintln!("{}", cli().render_help());
            process::exit(1);
        }
    };

    let config = match Config::load(&dir, Config::tolerate_from_env()) {
        Ok(config) => config,
        Err(e) => {
            logging::init_fallback();
            log_fatal("error loading configuration", &e);
            process::exit(role.config_failure_code());
        }
    };

    if let Err(e) = logging::init(&config.logging) {
        logging::init_fallback();
        log_fatal("error initializing logging", &e);
        process::exit(role.config_failure_code());
    }

    process::exit(run(role, sub, &config));
}

fn run(role: Role, sub: &ArgMatches, config: &Config) -> i32 {
    if role == Role::Clean {
        return entry::run_clean(config);
    }

    let input = match read_stdin() {
        Ok(input) => input,
        Err(e) => {
            log_fatal("error reading message", &*e);
            return role.config_failure_code();
        }
    };

    match role {
        Role::Mail => {
            let args: Vec<String> = sub
                .get_many::<String>("args")
                .map(|values| values.cloned().collect())
                .unwrap_or_default();
            log::trace!("args == {args:?}");
            entry::run_mail(config, &input, &args, &ProgramDelivery)
        }
        Role::Confirm => entry::run_confirm(config, &input, &ProgramDelivery),
        Role::Clean => entry::run_clean(config),
    }
}

fn read_stdin() -> anyhow::Result<Vec<u8>> {
    let mut input = Vec::new();
    io::stdin()
        .lock()
        .read_to_end(&mut input)
        .context("failed reading standard input")?;
    Ok(input)
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Set secret and confirmation_address before use.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(dir: &std::path::Path) {
    println!("Testing configuration in {}...", dir.display());

    let config = match Config::load(dir, Config::tolerate_from_env()) {
        Ok(config) => config,
        Err(e) => {
            println!("Configuration invalid: {e}");
            process::exit(1);
        }
    };

    let secret = if config.secret.is_empty() {
        "(empty)"
    } else {
        "(set)"
    };
    println!("  secret:               {secret}");
    println!("  mail_prog:            {}", config.mail_prog.join(" "));
    if !config.extra_mail_args.is_empty() {
        println!("  extra_mail_args:      {}", config.extra_mail_args.join(" "));
    }
    println!("  confirm_domain:       {}", config.confirm_domain.join(", "));
    println!("  token_recipient:      {}", config.token_recipient.join(", "));
    println!("  token_lifetime:       {}s", config.token_lifetime);
    println!("  auth_field:           {}", config.auth_field);
    println!(
        "  confirmation_address: {}",
        config.confirmation_address.as_deref().unwrap_or("(none)")
    );
    println!("  token_dir:            {}", config.token_dir().display());
    println!("  log level:            {}", config.logging.level);
    println!("Configuration OK");
}

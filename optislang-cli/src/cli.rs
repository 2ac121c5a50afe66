//! Application definition.

extern crate simplelog;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Error, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use optislang_core::config::CONFIG_FILE;
use optislang_core::{Config, DesignStudy, ManagedInstance, Optislang};
use optislang_net::{Client, Endpoint, LogContext};
use serde_json::{Map, Value};

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &'static str = env!("CARGO_PKG_AUTHORS");

pub fn app<'a, 'b>() -> App<'a, 'b> {
    let endpoint_arg = Arg::with_name("endpoint")
        .required(true)
        .long("endpoint")
        .short("e")
        .value_name("address")
        .help("Address of the server, e.g. tcp://127.0.0.1:5310, 127.0.0.1:5310 or local://name");

    App::new("osl")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .version(VERSION)
        .author(AUTHORS)
        .about("Launch and drive optiSLang servers from the command line.")
        .arg(Arg::with_name("verbosity")
            .long("verbosity")
            .short("v")
            .takes_value(true)
            .default_value("info")
            .value_name("verb")
            .global(true)
            .help("Set the verbosity of the log output"))
        .arg(Arg::with_name("config")
            .long("config")
            .short("c")
            .takes_value(true)
            .value_name("path")
            .global(true)
            .help("Path to the configuration file (defaults to ./optislang.toml if present)"))
        .arg(Arg::with_name("password")
            .long("password")
            .short("p")
            .takes_value(true)
            .global(true)
            .help("Password of the server"))

        // init subcommand
        .subcommand(SubCommand::with_name("init")
            .display_order(10)
            .about("Write a configuration file with default values")
            .arg(Arg::with_name("path")
                .value_name("path")
                .default_value(CONFIG_FILE)))

        // start subcommand
        .subcommand(SubCommand::with_name("start")
            .display_order(20)
            .about("Launch a local server and keep it alive until interrupted")
            .long_about("Launch a local server and keep it alive until interrupted.\n\n\
            The server is shut down on Ctrl-C. With `--run` the project is executed \n\
            once and the server is shut down as soon as it finishes.")
            .arg(Arg::with_name("project")
                .value_name("project-path")
                .help("Project file to open"))
            .arg(Arg::with_name("new")
                .long("new")
                .short("n")
                .help("Create the project instead of opening it"))
            .arg(Arg::with_name("executable")
                .long("executable")
                .short("x")
                .takes_value(true)
                .value_name("path")
                .help("Path to the optiSLang executable"))
            .arg(Arg::with_name("port-range")
                .long("port-range")
                .takes_value(true)
                .value_name("lo-hi")
                .help("Range of ports the server may listen on, e.g. 49690-49700"))
            .arg(Arg::with_name("run")
                .long("run")
                .short("r")
                .help("Execute the project, then shut the server down")))

        .subcommand(SubCommand::with_name("ping")
            .display_order(30)
            .about("Check whether a server is responding")
            .arg(endpoint_arg.clone()))
        .subcommand(SubCommand::with_name("status")
            .display_order(31)
            .about("Print the state of the project")
            .arg(endpoint_arg.clone()))
        .subcommand(SubCommand::with_name("query")
            .display_order(32)
            .about("Send a query and print the raw response")
            .arg(endpoint_arg.clone())
            .arg(Arg::with_name("name")
                .required(true)
                .value_name("name")
                .help("Name of the query, e.g. SERVER_INFO"))
            .arg(Arg::with_name("uid")
                .long("uid")
                .takes_value(true)
                .help("Uid of the actor the query is about"))
            .arg(Arg::with_name("hid")
                .long("hid")
                .takes_value(true)
                .help("Hierarchical id of the design")))

        .subcommand(SubCommand::with_name("run")
            .display_order(40)
            .about("Execute the project and wait for it to finish")
            .arg(endpoint_arg.clone()))
        .subcommand(SubCommand::with_name("stop")
            .display_order(41)
            .about("Stop the project")
            .arg(endpoint_arg.clone())
            .arg(Arg::with_name("gently")
                .long("gently")
                .short("g")
                .help("Let the designs already running finish"))
            .arg(Arg::with_name("wait")
                .long("wait")
                .short("w")
                .help("Wait until the project stopped")))
        .subcommand(SubCommand::with_name("reset")
            .display_order(42)
            .about("Reset the project")
            .arg(endpoint_arg.clone()))
        .subcommand(SubCommand::with_name("save")
            .display_order(43)
            .about("Save the project")
            .arg(endpoint_arg.clone())
            .arg(Arg::with_name("as")
                .long("as")
                .takes_value(true)
                .value_name("path")
                .help("Save to a different location, which becomes the project location"))
            .arg(Arg::with_name("copy")
                .long("copy")
                .takes_value(true)
                .value_name("path")
                .conflicts_with("as")
                .help("Save a copy, leaving the project location unchanged")))
        .subcommand(SubCommand::with_name("study")
            .display_order(44)
            .about("Execute parametric systems one after another")
            .arg(endpoint_arg.clone())
            .arg(Arg::with_name("system")
                .required(true)
                .multiple(true)
                .value_name("uid")
                .help("Uids of the parametric systems, in order of execution")))
        .subcommand(SubCommand::with_name("shutdown")
            .display_order(50)
            .about("Shut the server down")
            .arg(endpoint_arg))
}

pub fn app_matches() -> ArgMatches<'static> {
    app().get_matches()
}

/// Runs based on specified subcommand.
pub fn start(matches: ArgMatches) -> Result<()> {
    match matches.subcommand() {
        ("init", Some(m)) => start_init(m),
        ("start", Some(m)) => start_server(m),
        ("ping", Some(m)) => start_ping(m),
        ("status", Some(m)) => start_status(m),
        ("query", Some(m)) => start_query(m),
        ("run", Some(m)) => start_run(m),
        ("stop", Some(m)) => start_stop(m),
        ("reset", Some(m)) => start_reset(m),
        ("save", Some(m)) => start_save(m),
        ("study", Some(m)) => start_study(m),
        ("shutdown", Some(m)) => start_shutdown(m),
        _ => Ok(()),
    }
}

/// Loads the configuration file given on the command line, falling back
/// on the default file in the working directory, then on defaults.
fn load_config(matches: &ArgMatches) -> Result<Config> {
    let mut config = match matches.value_of("config") {
        Some(path) => {
            debug!(target: "osl", "loading config from {}", path);
            Config::from_file(path)?
        }
        None if Path::new(CONFIG_FILE).is_file() => {
            debug!(target: "osl", "loading config from {}", CONFIG_FILE);
            Config::from_file(CONFIG_FILE)?
        }
        None => Config::default(),
    };
    if let Some(password) = matches.value_of("password") {
        config.client.password = Some(password.to_string());
        config.process.password = Some(password.to_string());
    }
    Ok(config)
}

fn parse_endpoint(matches: &ArgMatches) -> Result<Endpoint> {
    let endpoint = matches
        .value_of("endpoint")
        .ok_or_else(|| Error::msg("server endpoint must be provided"))?;
    Ok(endpoint.parse()?)
}

fn connect(matches: &ArgMatches) -> Result<Optislang> {
    let config = load_config(matches)?;
    connect_with(matches, &config)
}

/// Connects using a configuration that was loaded already.
fn connect_with(matches: &ArgMatches, config: &Config) -> Result<Optislang> {
    setup_log_verbosity(matches);
    let endpoint = parse_endpoint(matches)?;
    Ok(Optislang::connect(endpoint, config, LogContext::new("osl")))
}

fn start_init(matches: &ArgMatches) -> Result<()> {
    let path = PathBuf::from(matches.value_of("path").unwrap_or(CONFIG_FILE));
    if path.exists() {
        return Err(Error::msg(format!("{} already exists", path.display())));
    }
    Config::default().save_to_file(&path)?;
    println!("created {}", path.display());
    Ok(())
}

/// Launches a local server based on the passed arguments.
fn start_server(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let mut config = load_config(matches)?;
    if let Some(project) = matches.value_of("project") {
        config.process.project_path = Some(PathBuf::from(project));
    }
    if matches.is_present("new") {
        config.process.new_project = true;
    }
    if let Some(executable) = matches.value_of("executable") {
        config.process.executable = PathBuf::from(executable);
    }
    if let Some(range) = matches.value_of("port-range") {
        config.process.port_range = Some(parse_port_range(range)?);
    }

    let osl = Optislang::launch(&config, LogContext::new("osl"))?;
    println!("server listening on {}", osl.endpoint().to_string().green());

    if matches.is_present("run") {
        let result = osl.start(true);
        if result.is_ok() {
            println!("project finished with status: {}", osl.get_status()?);
        }
        osl.shutdown(true)?;
        return Ok(result?);
    }

    // run a loop allowing graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }
    info!(target: "osl", "interrupted, shutting down the server");
    println!("Initiating graceful shutdown...");
    osl.shutdown(true)?;
    Ok(())
}

fn parse_port_range(s: &str) -> Result<(u16, u16)> {
    let mut split = s.splitn(2, '-');
    let lo = split.next().unwrap_or_default().trim().parse::<u16>()?;
    let hi = match split.next() {
        Some(hi) => hi.trim().parse::<u16>()?,
        None => lo,
    };
    if lo > hi {
        return Err(Error::msg(format!("invalid port range: {}", s)));
    }
    Ok((lo, hi))
}

fn start_ping(matches: &ArgMatches) -> Result<()> {
    let osl = connect(matches)?;
    osl.ping()?;
    println!("{} is alive", osl.endpoint());
    Ok(())
}

fn start_status(matches: &ArgMatches) -> Result<()> {
    let osl = connect(matches)?;
    let info = osl.basic_project_info()?;
    for project in &info.projects {
        println!("{} ({}): {}", project.name, project.location, project.state);
    }
    Ok(())
}

fn start_query(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let config = load_config(matches)?;
    let client = Client::new(
        parse_endpoint(matches)?,
        config.client_config(),
        LogContext::new("osl"),
    );
    let mut body = Map::new();
    let name = matches
        .value_of("name")
        .ok_or_else(|| Error::msg("query name must be provided"))?;
    body.insert("What".to_string(), Value::from(name.to_uppercase()));
    for key in &["uid", "hid"] {
        if let Some(value) = matches.value_of(key) {
            body.insert(key.to_string(), Value::from(value));
        }
    }
    let response = client.send_command(&Value::Object(body))?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn start_run(matches: &ArgMatches) -> Result<()> {
    let osl = connect(matches)?;
    osl.start(true)?;
    println!("project finished with status: {}", osl.get_status()?);
    Ok(())
}

fn start_stop(matches: &ArgMatches) -> Result<()> {
    let osl = connect(matches)?;
    let wait = matches.is_present("wait");
    if matches.is_present("gently") {
        osl.stop_gently(wait)?;
    } else {
        osl.stop(wait)?;
    }
    Ok(())
}

fn start_reset(matches: &ArgMatches) -> Result<()> {
    connect(matches)?.reset()?;
    Ok(())
}

fn start_save(matches: &ArgMatches) -> Result<()> {
    let osl = connect(matches)?;
    if let Some(path) = matches.value_of("as") {
        osl.save_as(path, true, false, false)?;
    } else if let Some(path) = matches.value_of("copy") {
        osl.save_copy(path)?;
    } else {
        osl.save()?;
    }
    Ok(())
}

fn start_study(matches: &ArgMatches) -> Result<()> {
    let config = load_config(matches)?;
    let osl = Arc::new(connect_with(matches, &config)?);
    let instances: Vec<ManagedInstance> = matches
        .values_of("system")
        .map(|v| v.map(|uid| ManagedInstance::parametric_system(uid, None)).collect())
        .unwrap_or_default();
    let mut study = DesignStudy::new(
        osl,
        instances,
        None,
        config.study,
        LogContext::new("osl").child("study"),
    );
    study.execute()?;
    let designs = study.get_result_designs()?;
    let feasible = designs.iter().filter(|d| d.is_feasible()).count();
    println!("{} designs evaluated, {} feasible", designs.len(), feasible);
    Ok(())
}

fn start_shutdown(matches: &ArgMatches) -> Result<()> {
    connect(matches)?.shutdown(false)?;
    println!("server shut down");
    Ok(())
}

fn setup_log_verbosity(matches: &ArgMatches) {
    use self::simplelog::{LevelFilter, TermLogger};
    let level_filter = match matches.value_of("verbosity") {
        Some(s) => match s {
            "0" | "none" => LevelFilter::Off,
            "1" | "err" | "error" | "min" => LevelFilter::Error,
            "2" | "warn" | "warning" | "default" => LevelFilter::Warn,
            "3" | "info" => LevelFilter::Info,
            "4" | "debug" => LevelFilter::Debug,
            "5" | "trace" | "max" | "all" => LevelFilter::Trace,
            _ => LevelFilter::Warn,
        },
        _ => LevelFilter::Warn,
    };
    let mut config_builder = simplelog::ConfigBuilder::new();
    let logger_conf = config_builder
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Debug)
        .set_location_level(LevelFilter::Error)
        .set_time_format_str("%H:%M:%S%.6f")
        .build();
    // a logger may be set up already
    let _ = TermLogger::init(level_filter, logger_conf, simplelog::TerminalMode::Mixed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_ranges() {
        assert_eq!(parse_port_range("49690-49700").unwrap(), (49690, 49700));
        assert_eq!(parse_port_range("5310").unwrap(), (5310, 5310));
        assert!(parse_port_range("10-5").is_err());
        assert!(parse_port_range("x-5").is_err());
    }

    #[test]
    fn subcommands_parse() {
        let matches = app()
            .get_matches_from_safe(vec!["osl", "stop", "-e", "127.0.0.1:5310", "--gently"])
            .unwrap();
        let (name, sub) = matches.subcommand();
        assert_eq!(name, "stop");
        let sub = sub.unwrap();
        assert!(sub.is_present("gently"));
        assert_eq!(parse_endpoint(sub).unwrap(), Endpoint::localhost(5310));

        assert!(app()
            .get_matches_from_safe(vec!["osl", "save", "-e", "x:1", "--as", "a", "--copy", "b"])
            .is_err());
        assert!(app().get_matches_from_safe(vec!["osl", "ping"]).is_err());
    }

    #[test]
    fn loaded_config_is_reused() {
        let missing = std::env::temp_dir().join("osl-missing-dir").join(CONFIG_FILE);
        let matches = app()
            .get_matches_from_safe(vec![
                "osl",
                "study",
                "-e",
                "127.0.0.1:5310",
                "--config",
                missing.to_str().unwrap(),
                "a",
            ])
            .unwrap();
        let sub = matches.subcommand_matches("study").unwrap();
        assert!(connect(sub).is_err());
        let osl = connect_with(sub, &Config::default()).unwrap();
        assert_eq!(osl.endpoint(), &Endpoint::localhost(5310));
    }
}

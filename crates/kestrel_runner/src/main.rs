//! Command-line front end for the kestrel engine.
//!
//! Follows the classic awk calling convention: program text or `-f`
//! source files, `-v` global assignments, data files as trailing
//! arguments. `--concurrent` fans one context per data file; OS signals
//! requested by the script are captured and broadcast to every running
//! context through the bridge relay.

mod os_signal;
mod settings;

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use kestrel_bridge::{Context, Engine, IoSpec, OutputSink, SignalRelay, TraitFlags, Value};
use tracing::info;

use crate::settings::Settings;

#[derive(Parser)]
#[command(name = "kestrel")]
#[command(about = "Run kestrel scripts over data files.", long_about = None)]
struct Cli {
    /// Source file; repeatable, parsed in order. Without it the first
    /// positional argument is the program text.
    #[arg(short = 'f', long = "file", value_name = "PATH")]
    files: Vec<PathBuf>,

    /// Assign a global variable before the program runs.
    #[arg(short = 'v', long = "assign", value_name = "NAME=VALUE")]
    assigns: Vec<String>,

    /// Field separator, stored into the FS global.
    #[arg(short = 'F', long = "field-separator", value_name = "SEP")]
    field_separator: Option<String>,

    /// Call this function instead of executing the top-level program.
    #[arg(short = 'c', long = "call", value_name = "NAME")]
    call: Option<String>,

    /// Process data files concurrently, one context per file. The value
    /// may be a boolean or an output suffix beginning with a period:
    /// `--concurrent=.out` writes the results for in.txt to in.txt.out
    /// unless the data file names an output half itself (`in:out`).
    #[arg(
        long,
        value_name = "BOOL|.SUFFIX",
        num_args = 0..=1,
        default_missing_value = "true",
        require_equals = true
    )]
    concurrent: Option<String>,

    /// Reading a never-assigned variable is an error.
    #[arg(long)]
    strict_vars: bool,

    /// Integer division yields floats.
    #[arg(long)]
    float_div: bool,

    /// Print the return value and named variables after the run.
    #[arg(short = 'D', long)]
    show_extra_info: bool,

    /// JSON settings file; flags override its entries.
    #[arg(long, value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Program text (without -f) followed by data files.
    #[arg(value_name = "ARG")]
    args: Vec<String>,
}

struct Assign {
    index: Option<usize>,
    value: String,
}

struct Config {
    assigns: HashMap<String, Assign>,
    call: Option<String>,
    field_separator: Option<String>,
    concurrent: bool,
    show_extra_info: bool,
    traits: TraitFlags,
    source_text: Option<String>,
    source_files: Vec<PathBuf>,
    data_in_files: Vec<String>,
    data_out_files: Vec<String>,
}

impl Config {
    fn resolve(cli: Cli) -> Result<Config> {
        let settings = match &cli.settings {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };

        let mut assigns: HashMap<String, Assign> = settings
            .assigns
            .iter()
            .map(|(name, value)| {
                let assign = Assign {
                    index: None,
                    value: value.clone(),
                };
                (name.clone(), assign)
            })
            .collect();
        for entry in &cli.assigns {
            let (name, value) = match entry.split_once('=') {
                Some((name, value)) => (name, value),
                None => (entry.as_str(), ""),
            };
            assigns.insert(
                name.to_string(),
                Assign {
                    index: None,
                    value: value.to_string(),
                },
            );
        }

        let (concurrent, suffix) = match cli.concurrent.as_deref() {
            None => (false, String::new()),
            Some(v) if v.starts_with('.') => (true, v.to_string()),
            Some(v) => (v.parse().unwrap_or(false), String::new()),
        };

        let mut args = cli.args;
        let source_text = if cli.files.is_empty() {
            if args.is_empty() {
                bail!("missing program text (pass it as the first argument or with -f)");
            }
            Some(args.remove(0))
        } else {
            None
        };
        let mut data_in_files = args;

        let mut data_out_files = vec![String::new(); data_in_files.len()];
        if concurrent {
            for index in 0..data_in_files.len() {
                if let Some((input, output)) = data_in_files[index].split_once(':') {
                    data_out_files[index] = output.to_string();
                    data_in_files[index] = input.to_string();
                } else if !suffix.is_empty()
                    && !data_in_files[index].is_empty()
                    && data_in_files[index] != "-"
                {
                    data_out_files[index] = format!("{}{}", data_in_files[index], suffix);
                }
            }
        }

        let mut traits = TraitFlags::empty();
        if cli.strict_vars || settings.strict_vars {
            traits = traits.with(TraitFlags::STRICT_VARS);
        }
        if cli.float_div || settings.float_div {
            traits = traits.with(TraitFlags::FLOAT_DIV);
        }

        Ok(Config {
            assigns,
            call: cli.call,
            field_separator: cli.field_separator.or(settings.field_separator),
            concurrent,
            show_extra_info: cli.show_extra_info || settings.show_extra_info,
            traits,
            source_text,
            source_files: cli.files,
            data_in_files,
            data_out_files,
        })
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(99)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let cfg = match Config::resolve(cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("ERROR: {err:#}");
            return ExitCode::from(99);
        }
    };

    match run(cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ERROR: {err:#}");
            ExitCode::from(255)
        }
    }
}

fn run(mut cfg: Config) -> Result<()> {
    let engine = Engine::open(kestrel_vm::library())?;

    for (name, assign) in cfg.assigns.iter_mut() {
        let index = match engine.find_global(name, true) {
            Ok(index) => index,
            Err(_) => engine
                .add_global(name)
                .with_context(|| format!("cannot add global variable '{name}'"))?,
        };
        assign.index = Some(index);
    }

    let fs_index = match &cfg.field_separator {
        Some(_) => Some(
            engine
                .find_global("FS", true)
                .context("cannot find global variable 'FS'")?,
        ),
        None => None,
    };

    if cfg.traits != TraitFlags::empty() {
        engine.set_trait_flags(cfg.traits)?;
    }

    if !cfg.source_files.is_empty() {
        engine.parse_files(&cfg.source_files)
    } else {
        engine.parse_text(cfg.source_text.as_deref().unwrap_or(""))
    }
    .context("cannot parse program")?;

    let relay = Arc::new(SignalRelay::spawn());
    let mut pump = os_signal::SignalPump::start(relay.clone());

    let outcome = if cfg.concurrent && !cfg.data_in_files.is_empty() {
        info!(files = cfg.data_in_files.len(), "running concurrently");
        let engine = &engine;
        let cfg = &cfg;
        let relay = &relay;
        rayon::scope(|scope| {
            for index in 0..cfg.data_in_files.len() {
                scope.spawn(move |_| {
                    if let Err(err) = run_script(engine, fs_index, Some(index), cfg, relay) {
                        eprintln!("ERROR: [{index}] {err:#}");
                    }
                });
            }
        });
        Ok(())
    } else {
        run_script(&engine, fs_index, None, &cfg, &relay)
    };

    pump.shutdown();
    relay.shutdown();
    engine.close();
    outcome
}

/// One context start to finish: open it against the data file selection,
/// seed the globals, run, report, close.
fn run_script(
    engine: &Engine,
    fs_index: Option<usize>,
    data_index: Option<usize>,
    cfg: &Config,
    relay: &SignalRelay,
) -> Result<()> {
    let io = match data_index {
        None => IoSpec {
            inputs: cfg.data_in_files.iter().map(PathBuf::from).collect(),
            output: OutputSink::Inherit,
        },
        Some(index) => {
            let output = if cfg.data_out_files[index].is_empty() {
                OutputSink::Inherit
            } else {
                let path = &cfg.data_out_files[index];
                let file = File::create(path)
                    .with_context(|| format!("cannot open output file '{path}'"))?;
                OutputSink::file(file)
            };
            IoSpec {
                inputs: vec![PathBuf::from(&cfg.data_in_files[index])],
                output,
            }
        }
    };
    let id = data_index.map(|index| index as u64 + 1).unwrap_or(0);
    let ctx = engine.new_context(id, io).context("cannot make context")?;

    let outcome = drive_context(&ctx, fs_index, cfg, relay);
    // Return and named values are still chained; the context close
    // sweeps them.
    ctx.close();
    outcome
}

fn drive_context(
    ctx: &Context,
    fs_index: Option<usize>,
    cfg: &Config,
    relay: &SignalRelay,
) -> Result<()> {
    for (name, assign) in &cfg.assigns {
        let Some(index) = assign.index else { continue };
        let value = ctx.new_num_or_str(&assign.value).with_context(|| {
            format!(
                "cannot convert value '{}' for global variable '{}'",
                assign.value, name
            )
        })?;
        let stored = ctx.set_global(index, &value);
        value.close();
        stored.with_context(|| format!("cannot set global variable '{name}'"))?;
    }

    if let (Some(index), Some(separator)) = (fs_index, cfg.field_separator.as_deref()) {
        let value = ctx
            .new_str(separator)
            .with_context(|| format!("cannot convert field separator '{separator}'"))?;
        let stored = ctx.set_global(index, &value);
        value.close();
        stored.with_context(|| format!("cannot set field separator to '{separator}'"))?;
    }

    ctx.on_sigset(|signo, reset| {
        if reset {
            os_signal::unwatch(signo);
        } else {
            os_signal::watch(signo);
        }
    });
    relay.enlist(ctx)?;

    let ret = match &cfg.call {
        Some(name) => {
            let mut args = Vec::with_capacity(cfg.data_in_files.len());
            for file in &cfg.data_in_files {
                args.push(
                    ctx.new_str(file)
                        .with_context(|| format!("cannot convert argument '{file}' to a value"))?,
                );
            }
            let arg_refs: Vec<&Value> = args.iter().collect();
            let ret = ctx.call(name, &arg_refs);
            // Closed here rather than left to the context teardown; a
            // looping caller would otherwise accumulate argument values.
            for arg in &args {
                arg.close();
            }
            ret
        }
        None => ctx.exec(&cfg.data_in_files),
    }
    .context("cannot run program")?;

    if cfg.show_extra_info {
        println!("[RETURN] - [{}]", ret.display());
        println!("NAMED VARIABLES]");
        for (name, value) in ctx.named_vars()? {
            println!("{name} = {}", value.display());
        }
        println!("END OF NAMED VARIABLES]");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(args: &[&str]) -> Config {
        let cli = Cli::try_parse_from(args).unwrap();
        Config::resolve(cli).unwrap()
    }

    #[test]
    fn first_positional_is_the_program_without_source_files() {
        let cfg = resolve(&["kestrel", "return 1;", "data.txt"]);
        assert_eq!(cfg.source_text.as_deref(), Some("return 1;"));
        assert!(cfg.source_files.is_empty());
        assert_eq!(cfg.data_in_files, vec!["data.txt"]);
    }

    #[test]
    fn source_files_keep_every_positional_as_data() {
        let cfg = resolve(&["kestrel", "-f", "prog.k", "a.txt", "b.txt"]);
        assert!(cfg.source_text.is_none());
        assert_eq!(cfg.source_files, vec![PathBuf::from("prog.k")]);
        assert_eq!(cfg.data_in_files, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn missing_program_text_is_rejected() {
        let cli = Cli::try_parse_from(["kestrel"]).unwrap();
        assert!(Config::resolve(cli).is_err());
    }

    #[test]
    fn assigns_parse_name_value_pairs() {
        let cfg = resolve(&["kestrel", "-v", "X=7", "-v", "FLAG", "return X;"]);
        assert_eq!(cfg.assigns["X"].value, "7");
        assert_eq!(cfg.assigns["FLAG"].value, "");
    }

    #[test]
    fn concurrent_splits_output_halves_and_applies_the_suffix() {
        let cfg = resolve(&["kestrel", "--concurrent=.gz", "p", "a:b", "c", "-"]);
        assert!(cfg.concurrent);
        assert_eq!(cfg.data_in_files, vec!["a", "c", "-"]);
        assert_eq!(cfg.data_out_files, vec!["b", "c.gz", ""]);
    }

    #[test]
    fn concurrent_accepts_booleans() {
        let cfg = resolve(&["kestrel", "--concurrent=false", "p", "a"]);
        assert!(!cfg.concurrent);
        assert!(cfg.data_out_files.iter().all(String::is_empty));

        let cfg = resolve(&["kestrel", "--concurrent", "p", "a"]);
        assert!(cfg.concurrent);
    }

    #[test]
    fn trait_flags_follow_the_switches() {
        let cfg = resolve(&["kestrel", "--strict-vars", "--float-div", "p"]);
        assert!(cfg.traits.contains(TraitFlags::STRICT_VARS));
        assert!(cfg.traits.contains(TraitFlags::FLOAT_DIV));

        let cfg = resolve(&["kestrel", "p"]);
        assert_eq!(cfg.traits, TraitFlags::empty());
    }

    fn capture_context(engine: &Engine) -> (Context, Arc<std::sync::Mutex<String>>) {
        let (sink, buffer) = OutputSink::capture();
        let io = IoSpec {
            inputs: Vec::new(),
            output: sink,
        };
        (engine.new_context(1, io).unwrap(), buffer)
    }

    #[test]
    fn assigned_globals_reach_the_running_program() {
        let mut cfg = resolve(&["kestrel", "-v", "X=7", "print(X);"]);
        let engine = Engine::open(kestrel_vm::library()).unwrap();
        for (name, assign) in cfg.assigns.iter_mut() {
            assign.index = Some(engine.add_global(name).unwrap());
        }
        engine.parse_text(cfg.source_text.as_deref().unwrap()).unwrap();
        let (ctx, buffer) = capture_context(&engine);
        let relay = SignalRelay::spawn();

        drive_context(&ctx, None, &cfg, &relay).unwrap();
        assert_eq!(buffer.lock().unwrap().as_str(), "7\n");

        ctx.close();
        relay.shutdown();
        engine.close();
    }

    #[test]
    fn call_mode_passes_data_file_names_as_arguments() {
        let cfg = resolve(&[
            "kestrel",
            "--call",
            "join",
            "function join(a, b) { print(a, b); }",
            "in.txt",
            "out.txt",
        ]);
        let engine = Engine::open(kestrel_vm::library()).unwrap();
        engine.parse_text(cfg.source_text.as_deref().unwrap()).unwrap();
        let (ctx, buffer) = capture_context(&engine);
        let relay = SignalRelay::spawn();

        drive_context(&ctx, None, &cfg, &relay).unwrap();
        assert_eq!(buffer.lock().unwrap().as_str(), "in.txt out.txt\n");

        ctx.close();
        relay.shutdown();
        engine.close();
    }
}

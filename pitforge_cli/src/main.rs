use pitforge_core::config::{FieldSetting, PitSettings, PitforgeConfig};
use pitforge_core::{
    Cracker, DataTree, ExprEvaluator, FixupRegistry, ModelBuilder, Pit, Renderer, TreeSnapshot,
    apply_data_set, apply_rules,
};

use clap::{Parser, Subcommand};
use log::{debug, info};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Pit document to load, overriding `[pit] path`.
    #[clap(short, long, value_parser)]
    pit: Option<PathBuf>,
    #[clap(short, long)]
    model: Option<String>,
    #[clap(short, long)]
    data_set: Option<String>,
    /// Extra field override as `name=value`, applied after the config's fields.
    #[clap(short, long = "field", value_parser = parse_field)]
    fields: Vec<FieldSetting>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render the model and write the bytes.
    Render {
        #[clap(short, long, value_parser)]
        output: Option<PathBuf>,
    },
    /// Crack a file into the model and print the populated tree.
    Crack {
        #[clap(value_parser)]
        input: PathBuf,
        #[clap(long)]
        strict_trailing: bool,
        #[clap(long)]
        max_array_occurs: Option<u32>,
    },
    /// Render the model and print its tree with each element's bits.
    Show,
}

fn parse_field(text: &str) -> Result<FieldSetting, String> {
    let (name, value) = text
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{text}'"))?;
    Ok(FieldSetting {
        name: name.to_string(),
        value: value.to_string(),
        value_type: Default::default(),
    })
}

fn load_config(cli: &Cli) -> Result<PitforgeConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            println!("Loading configuration from specified path: {config_path:?}",);
            PitforgeConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("pitforge.toml");
            if default_config_path.exists() {
                println!(
                    "No config file specified via CLI, loading default: {default_config_path:?}",
                );
                PitforgeConfig::load_from_file(&default_config_path)?
            } else {
                debug!("no config file specified and 'pitforge.toml' not found, using built-in defaults");
                PitforgeConfig::default()
            }
        }
    };

    if let Some(path) = &cli.pit {
        let pit = config.pit.get_or_insert_with(|| PitSettings {
            path: path.clone(),
            model: None,
            data_set: None,
        });
        pit.path = path.clone();
    }
    if let Some(pit) = config.pit.as_mut() {
        if cli.model.is_some() {
            pit.model = cli.model.clone();
        }
        if cli.data_set.is_some() {
            pit.data_set = cli.data_set.clone();
        }
    }
    config.fields.extend(cli.fields.iter().cloned());
    if let Command::Crack {
        strict_trailing,
        max_array_occurs,
        ..
    } = &cli.command
    {
        config.engine.strict_trailing |= *strict_trailing;
        if let Some(max) = max_array_occurs {
            config.engine.max_array_occurs = *max;
        }
    }
    Ok(config)
}

/// Loads the pit and builds the configured model with data set, fields and
/// mutability rules applied.
fn prepare(config: &PitforgeConfig, builder: &ModelBuilder<'_>) -> Result<DataTree, anyhow::Error> {
    let settings = config
        .pit
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("No pit document given; pass --pit or set [pit] path"))?;
    let pit = Pit::load(&settings.path)?;
    let model = match &settings.model {
        Some(model) => model.clone(),
        None => pit
            .default_model()
            .map(|m| m.name.clone())
            .ok_or_else(|| anyhow::anyhow!("{:?} declares no data model", settings.path))?,
    };
    info!("building model {model}");
    let mut tree = pit.build(builder, &model)?;

    if let Some(name) = &settings.data_set {
        apply_data_set(&mut tree, builder, &pit.data_set(name)?.fields)?;
    }
    apply_data_set(&mut tree, builder, &config.field_overrides())?;
    apply_rules(&mut tree, &config.mutability_rules())?;
    if config.engine.select_default_choices {
        tree.select_defaults(tree.root());
    }
    Ok(tree)
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    debug!("effective configuration: {config:#?}");

    let evaluator = ExprEvaluator;
    let fixups = FixupRegistry::with_builtins();
    let builder = ModelBuilder::new(&evaluator, &fixups);
    let mut tree = prepare(&config, &builder)?;
    let start_time = Instant::now();

    match &cli.command {
        Command::Render { output } => {
            let rendered = Renderer::new(&evaluator, &fixups).render(&mut tree)?;
            println!(
                "Rendered {} bytes ({} bits), md5 {}",
                rendered.bytes().len(),
                rendered.len_bits(),
                rendered.digest()
            );
            for stream in rendered.streams(&tree) {
                println!(
                    "  Stream '{}' (attribute {}): {} bytes",
                    stream.name,
                    stream.attribute,
                    stream.content.len_bytes()
                );
            }
            match output {
                Some(path) => {
                    std::fs::write(path, rendered.bytes()).map_err(|e| {
                        anyhow::anyhow!("Failed to write rendered output to {:?}: {}", path, e)
                    })?;
                    println!("Wrote {path:?}");
                }
                None => println!("{}", rendered.bits().to_hex()),
            }
        }
        Command::Crack { input, .. } => {
            let data = std::fs::read(input)
                .map_err(|e| anyhow::anyhow!("Failed to read input file {:?}: {}", input, e))?;
            println!("Cracking {} bytes, md5 {:x}", data.len(), md5::compute(&data));
            let outcome = Cracker::new(&evaluator, config.engine.crack_settings())
                .crack(&mut tree, &data)?;
            println!(
                "Consumed {} bits, {} bits left over",
                outcome.consumed_bits, outcome.remaining_bits
            );
            let snapshot = TreeSnapshot::capture(&tree, tree.root());
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Show => {
            let rendered = Renderer::new(&evaluator, &fixups).render(&mut tree)?;
            let snapshot = TreeSnapshot::capture_rendered(&tree, tree.root(), &rendered);
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }
    debug!("finished in {:.2?}", start_time.elapsed());

    Ok(())
}

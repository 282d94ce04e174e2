use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use python_ls_broker::activation::Variant;
use python_ls_broker::backend::ServerCommand;
use python_ls_broker::config::{FullVariant, Settings};
use python_ls_broker::lsp::server::{ServerOptions, run_server};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FullChoice {
    A,
    B,
}

impl From<FullChoice> for FullVariant {
    fn from(choice: FullChoice) -> Self {
        match choice {
            FullChoice::A => FullVariant::A,
            FullChoice::B => FullVariant::B,
        }
    }
}

/// Language server front-end that activates one Python analysis server per
/// workspace folder and interpreter.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Full server A program
    #[arg(long, default_value = "python-language-server")]
    full_a: String,

    /// Extra argument for full server A (repeatable)
    #[arg(long = "full-a-arg", allow_hyphen_values = true)]
    full_a_args: Vec<String>,

    /// Install folder of full server A, used for bundled stubs
    #[arg(long)]
    full_a_folder: Option<PathBuf>,

    /// Full server B program
    #[arg(long, default_value = "pyright-langserver")]
    full_b: String,

    /// Extra argument for full server B (repeatable)
    #[arg(long = "full-b-arg", allow_hyphen_values = true, default_values = ["--stdio"])]
    full_b_args: Vec<String>,

    /// Simple server program
    #[arg(long, default_value = "jedi-language-server")]
    simple: String,

    /// Extra argument for the simple server (repeatable)
    #[arg(long = "simple-arg", allow_hyphen_values = true)]
    simple_args: Vec<String>,

    /// Full variant tried before falling back
    #[arg(long, value_enum, default_value = "b")]
    full_variant: FullChoice,

    /// Always use the simple server
    #[arg(long)]
    use_simple: bool,

    /// Interpreter used when no pythonPath setting is present
    #[arg(long)]
    python: Option<PathBuf>,
}

impl Cli {
    fn into_options(self) -> ServerOptions {
        let command = |program: String, args: Vec<String>| {
            args.into_iter()
                .fold(ServerCommand::new(program), |command, arg| command.arg(arg))
        };

        let commands = HashMap::from([
            (Variant::FullA, command(self.full_a, self.full_a_args)),
            (Variant::FullB, command(self.full_b, self.full_b_args)),
            (Variant::Simple, command(self.simple, self.simple_args)),
        ]);
        let server_folders = self
            .full_a_folder
            .map(|folder| HashMap::from([(Variant::FullA, folder)]))
            .unwrap_or_default();

        ServerOptions {
            commands,
            server_folders,
            settings: Settings {
                use_simple_variant: self.use_simple,
                full_variant: self.full_variant.into(),
                ..Settings::default()
            },
            python: self.python,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_server(cli.into_options()).await
}

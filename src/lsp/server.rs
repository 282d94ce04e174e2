use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tower_lsp::{Client, LspService, Server};
use tracing::info;

use crate::activation::{Backends, OptionsServices, Selector, Variant, VariantServices};
use crate::backend::{ProcessBackendFactory, ServerCommand};
use crate::config::Settings;
use crate::host::platform::{
    ConfiguredRuntime, EnvFileEnvironment, PathInstaller, PlatformCompatibility,
};
use crate::host::{EnvironmentVariables, HostClient, NoExperiments, RuntimeResolver, WorkspaceEvents};
use crate::log::init;
use crate::lsp::host::{ClientHost, ClientPrompter, ClientTelemetry, HostWorkspace};
use crate::lsp::proxy::Proxy;
use crate::middleware::ConfigurationSources;
use crate::telemetry::{TelemetrySink, TracingTelemetry};

/// How the broker launches each backend, plus startup defaults.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub commands: HashMap<Variant, ServerCommand>,
    /// Install folder per variant, used for bundled typeshed stubs.
    pub server_folders: HashMap<Variant, PathBuf>,
    /// Used until the editor sends its own `python` settings.
    pub settings: Settings,
    pub python: Option<PathBuf>,
}

pub async fn run_server(options: ServerOptions) -> anyhow::Result<()> {
    init()?;

    info!("Starting python-ls-broker server");

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = LspService::new(move |client| build_proxy(client, options));
    Server::new(stdin, stdout, socket).serve(service).await;

    info!("python-ls-broker server stopped");
    Ok(())
}

/// Wires the production collaborators around an editor connection.
pub fn build_proxy(client: Client, options: ServerOptions) -> Proxy {
    let host = Arc::new(HostWorkspace::new(options.settings));
    let events = WorkspaceEvents::new();
    let environment: Arc<dyn EnvironmentVariables> =
        Arc::new(EnvFileEnvironment::new(host.clone(), host.clone()));
    let runtimes: Arc<dyn RuntimeResolver> =
        Arc::new(ConfiguredRuntime::new(host.clone(), options.python));
    let telemetry: Arc<dyn TelemetrySink> =
        Arc::new(ClientTelemetry::new(client.clone(), Arc::new(TracingTelemetry)));
    let host_client: Arc<dyn HostClient> = Arc::new(ClientHost::new(client.clone()));
    let sources = ConfigurationSources {
        runtimes: runtimes.clone(),
        environment: environment.clone(),
    };

    let mut backends = Backends::new();
    let mut programs = HashMap::new();
    for (variant, command) in options.commands {
        programs.insert(variant, command.program.clone());
        backends = backends.with(Arc::new(
            ProcessBackendFactory::new(variant, command, host_client.clone(), telemetry.clone())
                .with_configuration_sources(sources.clone()),
        ));
    }

    let services = VariantServices {
        settings: host.clone(),
        experiments: Arc::new(NoExperiments),
        compatibility: Arc::new(PlatformCompatibility::default()),
        installer: Arc::new(PathInstaller::new(programs)),
        prompter: Arc::new(ClientPrompter::new(client.clone())),
        telemetry,
    };

    let mut options_services =
        OptionsServices::new(host.clone(), host.clone(), environment, events.clone());
    for (variant, folder) in options.server_folders {
        options_services = options_services.with_server_folder(variant, folder);
    }

    let selector = Selector::new(runtimes, services, options_services, backends);
    Proxy::new(client, host, events, selector)
}

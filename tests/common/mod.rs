#![allow(dead_code)]

use esdlscript::config::{EnvironmentConfig, LogAgentConfig};
use esdlscript::xml::Document;
use esdlscript::{Environment, ProcessContext, ServiceRequest};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

pub const SERVICE: &str = "Foo";
pub const METHOD: &str = "Bar";

pub fn log_agents() -> Vec<LogAgentConfig> {
    [("file", "local", "audit"), ("db", "remote", "audit"), ("mq", "remote", "stream")]
        .into_iter()
        .map(|(name, variant_type, group)| LogAgentConfig {
            name: name.to_string(),
            variant_type: variant_type.to_string(),
            group: group.to_string(),
        })
        .collect()
}

pub fn environment() -> Environment {
    Environment::new(EnvironmentConfig {
        log_agents: log_agents(),
        ..EnvironmentConfig::default()
    })
}

/// Loads `phases` as the script of the test method, asserting a clean load.
pub fn environment_with(phases: &str) -> Environment {
    let environment = environment();
    let script = format!("<EsdlScript>{}</EsdlScript>", phases);
    let outcomes = environment.load(&script, SERVICE, Some(METHOD));
    assert!(
        !outcomes.is_error() && outcomes.count_at_least(esdlscript::outcome::Severity::Warning) == 0,
        "unexpected load outcomes: {:?}",
        outcomes.events()
    );
    environment
}

pub fn context(environment: &Environment, request: &str) -> ProcessContext {
    environment.create_process_context(
        &ServiceRequest::new(SERVICE, METHOD),
        Document::parse(request).expect("request parses"),
    )
}

pub fn response(context: &ProcessContext) -> String {
    context.response().to_xml().expect("response serializes")
}

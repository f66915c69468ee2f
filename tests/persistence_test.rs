mod common;

use common::{context, environment_with};
use esdlscript::persist::Persistent;
use esdlscript::trace::{LogLevel, TraceCategory};
use esdlscript::variables::SCRIPT_FRAME;
use esdlscript::xml::Document;
use esdlscript::{PhaseResult, ScriptResult};
use pretty_assertions::assert_eq;

#[test]
fn test_process_state_survives_persistence() -> ScriptResult<()> {
    let environment = environment_with(
        r#"
        <xsdl:LogManagerPhase>
            <xsdl:ExcludeLogAgents by="name" pattern="db"/>
        </xsdl:LogManagerPhase>"#,
    );
    let mut original = context(&environment, "<Req/>");
    original
        .variables_mut()
        .define_variable("tenant", "acme", SCRIPT_FRAME)?;
    original
        .trace_state_mut()
        .set_log_level(TraceCategory::UserProgress, LogLevel::MAX, None)?;
    original.outcomes_mut().warning(7, "first pass");
    assert_eq!(environment.process_log_manager(&mut original)?, PhaseResult::Success);

    let xml = original.to_xml()?;
    let restored = environment.restore_process_context(&xml, Document::parse("<Req/>")?)?;

    assert_eq!(restored.transaction(), original.transaction());
    assert_eq!((restored.service(), restored.method()), ("Foo", "Bar"));
    assert_eq!(restored.variables().visible(), original.variables().visible());
    assert_eq!(
        restored.read_cursor().bindings().get("TENANT").as_deref(),
        Some("acme")
    );
    assert_eq!(
        restored.trace_state().log_level(TraceCategory::UserProgress),
        LogLevel::MAX
    );
    assert_eq!(restored.outcomes().severity(), original.outcomes().severity());
    assert_eq!(restored.outcomes().events().len(), original.outcomes().events().len());

    let names = |context: &esdlscript::ProcessContext| -> Vec<String> {
        context
            .log_agents()
            .enabled_variants()
            .iter()
            .map(|v| v.name().to_string())
            .collect()
    };
    assert_eq!(names(&restored), vec!["file".to_string(), "mq".to_string()]);
    assert_eq!(names(&restored), names(&original));
    Ok(())
}

#[test]
fn test_damaged_component_keeps_its_state() -> ScriptResult<()> {
    let environment = environment_with("");
    let mut context = context(&environment, "<Req/>");
    context
        .variables_mut()
        .define_variable("kept", "1", SCRIPT_FRAME)?;

    let xml = format!(
        r#"<ProcessContext service="Foo" method="Bar" phase="unknown" transaction="{}">
            <Variables frames="x"><Frame index="0"/></Variables>
            <TraceState frames="1"><Frame index="0"><Category id="user_info" level="3"/></Frame></TraceState>
        </ProcessContext>"#,
        context.transaction()
    );
    context.restore_xml(&xml)?;

    assert_eq!(context.variables().query_variable("kept").unwrap().value, "1");
    assert_eq!(
        context.trace_state().log_level(TraceCategory::UserInfo),
        LogLevel(3)
    );
    assert_eq!(context.trace_state().depth(), 1);
    Ok(())
}

mod common;

use common::{context, environment, environment_with, response, METHOD, SERVICE};
use esdlscript::outcome::Severity;
use esdlscript::{Phase, PhaseResult, ScriptResult};
use pretty_assertions::assert_eq;

const CHOOSE: &str = r#"
    <xsdl:RequestPhase>
        <xsdl:choose>
            <xsdl:when test="/Req/Kind = 'a'">
                <xsdl:appendValue target="Out" value="'A1'"/>
                <xsdl:appendValue target="Out" value="'A2'"/>
            </xsdl:when>
            <xsdl:when test="/Req/Kind = 'b'">
                <xsdl:appendValue target="Out" value="'B'"/>
            </xsdl:when>
            <xsdl:when test="/Req/Kind != 'z'">
                <xsdl:appendValue target="Out" value="'C'"/>
            </xsdl:when>
            <xsdl:otherwise>
                <xsdl:appendValue target="Out" value="'O'"/>
            </xsdl:otherwise>
        </xsdl:choose>
    </xsdl:RequestPhase>"#;

fn run(phases: &str, request: &str) -> ScriptResult<String> {
    let environment = environment_with(phases);
    let mut context = context(&environment, request);
    assert_eq!(environment.process_request(&mut context)?, PhaseResult::Success);
    Ok(response(&context))
}

#[test]
fn test_choose_processes_only_the_first_true_branch() -> ScriptResult<()> {
    assert_eq!(run(CHOOSE, "<Req><Kind>a</Kind></Req>")?, "<Out>A1A2</Out>");
    assert_eq!(run(CHOOSE, "<Req><Kind>b</Kind></Req>")?, "<Out>B</Out>");
    assert_eq!(run(CHOOSE, "<Req><Kind>c</Kind></Req>")?, "<Out>C</Out>");
    assert_eq!(run(CHOOSE, "<Req><Kind>z</Kind></Req>")?, "<Out>O</Out>");
    Ok(())
}

#[test]
fn test_switch_compares_case_values() -> ScriptResult<()> {
    let switch = r#"
        <xsdl:RequestPhase>
            <xsdl:switch test="/Req/Kind">
                <xsdl:case value="'a'"><xsdl:SetValue target="Out" value="'first'"/></xsdl:case>
                <xsdl:case value="concat('b', 'b')"><xsdl:SetValue target="Out" value="'second'"/></xsdl:case>
                <xsdl:case value="'bb'"><xsdl:SetValue target="Out" value="'shadowed'"/></xsdl:case>
                <xsdl:default><xsdl:SetValue target="Out" value="'other'"/></xsdl:default>
            </xsdl:switch>
        </xsdl:RequestPhase>"#;
    assert_eq!(run(switch, "<Req><Kind>a</Kind></Req>")?, "<Out>first</Out>");
    assert_eq!(run(switch, "<Req><Kind>bb</Kind></Req>")?, "<Out>second</Out>");
    assert_eq!(run(switch, "<Req><Kind>q</Kind></Req>")?, "<Out>other</Out>");
    assert_eq!(run(switch, "<Req/>")?, "<Out>other</Out>");
    Ok(())
}

#[test]
fn test_if_gates_its_children() -> ScriptResult<()> {
    let script = r#"
        <xsdl:RequestPhase>
            <xsdl:if test="count(/Req/Item) > 1">
                <xsdl:SetValue target="Many" value="count(/Req/Item)"/>
            </xsdl:if>
            <xsdl:if test="not(/Req/Item)">
                <xsdl:SetValue target="None" value="'true'"/>
            </xsdl:if>
        </xsdl:RequestPhase>"#;
    assert_eq!(run(script, "<Req><Item/><Item/></Req>")?, "<Many>2</Many>");
    assert_eq!(run(script, "<Req><Item/></Req>")?, "");
    assert_eq!(run(script, "<Req/>")?, "<None>true</None>");
    Ok(())
}

#[test]
fn test_misplaced_branches_are_rejected_at_load() {
    let environment = environment();
    let outcomes = environment.load(
        r#"<EsdlScript>
            <xsdl:RequestPhase>
                <xsdl:when test="true()"/>
                <xsdl:choose>
                    <xsdl:otherwise/>
                    <xsdl:when test="true()"/>
                    <xsdl:SetValue target="X" value="'1'"/>
                </xsdl:choose>
                <xsdl:switch test="'x'">
                    <xsdl:default/>
                    <xsdl:default/>
                </xsdl:switch>
            </xsdl:RequestPhase>
        </EsdlScript>"#,
        SERVICE,
        Some(METHOD),
    );
    assert_eq!(outcomes.error_count(), 0);
    assert_eq!(outcomes.count_at_least(Severity::Warning), 4);

    let request = environment.query_phase(SERVICE, METHOD, Phase::Request).unwrap();
    let tags: Vec<&str> = request.children().iter().map(|c| c.tag()).collect();
    assert_eq!(tags, vec!["xsdl:choose", "xsdl:switch"]);
    assert_eq!(request.children()[0].children().len(), 1);
    assert_eq!(request.children()[1].children().len(), 1);
}

#[test]
fn test_invalid_expressions_drop_the_statement() {
    let environment = environment();
    let outcomes = environment.load(
        r#"<EsdlScript><xsdl:RequestPhase>
            <xsdl:if test="Req/("><xsdl:SetValue target="X" value="'1'"/></xsdl:if>
            <xsdl:if><xsdl:SetValue target="Y" value="'1'"/></xsdl:if>
        </xsdl:RequestPhase></EsdlScript>"#,
        SERVICE,
        Some(METHOD),
    );
    assert_eq!(outcomes.error_count(), 2);
    let request = environment.query_phase(SERVICE, METHOD, Phase::Request).unwrap();
    assert!(request.children().is_empty());
}

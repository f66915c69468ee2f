mod common;

use std::thread;

use common::{context, environment_with, response};
use esdlscript::PhaseResult;
use pretty_assertions::assert_eq;

#[test]
fn test_one_environment_serves_many_threads() {
    let environment = environment_with(
        r#"
        <xsdl:RequestPhase>
            <xsdl:variable name="id" select="/Req/Id"/>
            <xsdl:choose>
                <xsdl:when test="/Req/Id > 50"><xsdl:SetValue target="Out/Size" value="'large'"/></xsdl:when>
                <xsdl:otherwise><xsdl:SetValue target="Out/Size" value="'small'"/></xsdl:otherwise>
            </xsdl:choose>
            <xsdl:SetValue target="Out/Id" value="$id"/>
        </xsdl:RequestPhase>"#,
    );

    let responses: Vec<(u32, String)> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8u32)
            .map(|worker| {
                let environment = &environment;
                scope.spawn(move || {
                    (0..25u32)
                        .map(|n| {
                            let id = worker * 25 + n;
                            let mut context =
                                context(environment, &format!("<Req><Id>{}</Id></Req>", id));
                            let result = environment.process_request(&mut context).unwrap();
                            assert_eq!(result, PhaseResult::Success);
                            (id, response(&context))
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });

    assert_eq!(responses.len(), 200);
    for (id, xml) in responses {
        let size = if id > 50 { "large" } else { "small" };
        assert_eq!(xml, format!("<Out><Size>{}</Size><Id>{}</Id></Out>", size, id));
    }
}

use criterion::{criterion_group, criterion_main, Criterion};
use esdlscript::xml::Document;
use esdlscript::{Environment, ServiceRequest};

const SCRIPT: &str = r#"
<EsdlScript>
    <xsdl:RequestPhase>
        <xsdl:variable name="user" select="/Req/User"/>
        <xsdl:choose>
            <xsdl:when test="/Req/Item > 3"><xsdl:SetValue target="Out/Tier" value="'gold'"/></xsdl:when>
            <xsdl:otherwise><xsdl:SetValue target="Out/Tier" value="'basic'"/></xsdl:otherwise>
        </xsdl:choose>
        <xsdl:SetValue target="Out/User" value="concat('user:', $user)"/>
    </xsdl:RequestPhase>
</EsdlScript>"#;

fn bench_process_request(c: &mut Criterion) {
    let environment = Environment::default();
    environment.load(SCRIPT, "Shop", Some("Order"));
    let request = ServiceRequest::new("Shop", "Order");

    c.bench_function("process request phase", |b| {
        b.iter(|| {
            let document = Document::parse("<Req><User>ann</User><Item>5</Item></Req>")
                .expect("request parses");
            let mut context = environment.create_process_context(&request, document);
            environment
                .process_request(&mut context)
                .expect("phase runs")
        })
    });
}

fn bench_load_script(c: &mut Criterion) {
    c.bench_function("load script", |b| {
        b.iter(|| {
            let environment = Environment::default();
            environment.load(SCRIPT, "Shop", Some("Order"))
        })
    });
}

criterion_group!(benches, bench_process_request, bench_load_script);
criterion_main!(benches);

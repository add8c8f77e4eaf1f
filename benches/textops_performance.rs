use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ssbc_textops::*;
use std::sync::Arc;
use std::time::Duration;

const INVITE_WITH_SDP: &str = r#"INVITE sip:967716910167@197.255.224.99;user=phone SIP/2.0
From: "+2693347248"<sip:+2693347248@197.255.224.100;user=phone>;tag=s26208d1i1z111r290308928
To: "+967716910167"<sip:967716910167@197.255.224.99;user=phone>
Call-ID: 7034cb95-68867afa-17e8fd7-7fc19d58b7d0-6be0ffc5-13c4-7225
CSeq: 1 INVITE
User-Agent: Orchid 3.1.32.6
Supported: 100rel,timer,replaces
Max-Forwards: 68
P-Asserted-Identity: <tel:+2693347248>
Allow: PRACK,BYE,CANCEL,ACK,INVITE,UPDATE,OPTIONS
Via: SIP/2.0/UDP 197.255.224.100:5060;rport;branch=z9hG4bK-5801fe38-17e8fd7-d661e03c-7fc1a2273910
Route: <sip:197.255.224.99:5060;transport=UDP;lr>
Contact: <sip:+2693347248@197.255.224.100:5060;transport=UDP;user=phone>
Content-Type: application/sdp
Content-Length: 250

v=0
o=- 226208 26208 IN IP4 197.255.224.100
s=Cataleya
c=IN IP4 197.255.224.100
t=0 0
m=audio 18076 RTP/AVP 8 0 18 116
a=rtpmap:8 PCMA/8000
a=ptime:20
a=rtpmap:0 PCMU/8000
a=rtpmap:18 G729/8000
a=rtpmap:116 telephone-event/8000
"#;

fn invite() -> Vec<u8> {
    INVITE_WITH_SDP.replace('\n', "\r\n").into_bytes()
}

/// Linearizing edit lists of growing size
fn bench_linearize(c: &mut Criterion) {
    let buf = vec![b'a'; 64 * 1024];
    let mut group = c.benchmark_group("linearize");

    for edits in [0usize, 16, 256, 4096].iter() {
        group.throughput(Throughput::Bytes(buf.len() as u64));
        group.bench_with_input(BenchmarkId::new("deletes", edits), edits, |b, &edits| {
            b.iter(|| {
                let mut list = EditList::new(buf.len());
                let stride = buf.len() / edits.max(1);
                for i in 0..edits {
                    let handle = list.delete(i * stride, 4).unwrap();
                    list.insert_after(handle, "xy").unwrap();
                }
                black_box(list.linearize(black_box(&buf)));
            })
        });
    }
    group.finish();
}

/// Substitution over a real INVITE
fn bench_subst(c: &mut Criterion) {
    let raw = invite();
    let body_ip = SubstExpr::parse("s/IN IP4 197\\.255\\.224\\.100/IN IP4 10.0.0.1/g").unwrap();
    let uri = SubstExpr::parse("s/^sip:([0-9]+)@.*$/sip:\\1@10.0.0.2/").unwrap();

    let mut group = c.benchmark_group("subst");
    group.throughput(Throughput::Bytes(raw.len() as u64));

    group.bench_function("subst_body_global", |b| {
        b.iter(|| {
            let mut msg = SipMessage::new(raw.clone()).unwrap();
            black_box(msg.subst_body(&body_ip)).unwrap();
            black_box(msg.build()).unwrap();
        })
    });

    group.bench_function("subst_uri", |b| {
        b.iter(|| {
            let mut msg = SipMessage::new(raw.clone()).unwrap();
            black_box(msg.subst_uri(&uri)).unwrap();
            black_box(msg.build()).unwrap();
        })
    });

    group.bench_function("expression_parse", |b| {
        b.iter(|| black_box(SubstExpr::parse(black_box("s/a(b+)c/x\\1y/gi"))).unwrap())
    });
    group.finish();
}

/// Header removal and insertion
fn bench_header_rewrites(c: &mut Criterion) {
    let raw = invite();
    let pai = HeaderMatcher::from_name("P-Asserted-Identity");
    let via = HeaderMatcher::ByType(HeaderType::Via);

    let mut group = c.benchmark_group("headers");
    group.bench_function("remove_hf", |b| {
        b.iter(|| {
            let mut msg = SipMessage::new(raw.clone()).unwrap();
            black_box(msg.remove_hf(&pai)).unwrap();
            black_box(msg.build()).unwrap();
        })
    });
    group.bench_function("insert_hf_before_via", |b| {
        b.iter(|| {
            let mut msg = SipMessage::new(raw.clone()).unwrap();
            black_box(msg.insert_hf("Via: SIP/2.0/UDP 10.0.0.1;branch=z9hG4bK1\r\n", Some(&via))).unwrap();
            black_box(msg.build()).unwrap();
        })
    });
    group.finish();
}

/// Parallel plan execution
fn bench_batch(c: &mut Criterion) {
    let raw = invite();
    let plan = RewritePlan::new()
        .step(RewriteStep::RemoveHf(HeaderMatcher::from_name("User-Agent")))
        .step(RewriteStep::SubstBody(Arc::new(
            SubstExpr::parse("s/197\\.255\\.224\\.100/10.0.0.1/g").unwrap(),
        )));

    let mut group = c.benchmark_group("batch");
    group.measurement_time(Duration::from_secs(10));
    for size in [100usize, 1000, 10000].iter() {
        let messages: Vec<Vec<u8>> = (0..*size).map(|_| raw.clone()).collect();
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("process_batch", size), &messages, |b, messages| {
            b.iter(|| black_box(process_batch(&plan, messages)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_linearize, bench_subst, bench_header_rewrites, bench_batch);
criterion_main!(benches);

//! End-to-end behaviour of the composed server interceptor chain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use girder::config::RpcServerConf;
use girder::interceptor::{server_chain, Request, Response, SheddingLayer};
use girder::status::{Code, Status};
use shedder::{Shedder, SheddingStat};
use tower::util::BoxCloneService;
use tower::{Layer, ServiceExt};

fn conf(timeout_ms: u64) -> RpcServerConf {
    let mut conf = RpcServerConf {
        listen_on: "0.0.0.0:0".to_string(),
        timeout: timeout_ms,
        // chain tests drive shedding explicitly; keep the cpu path off
        cpu_threshold: 0,
        ..Default::default()
    };
    conf.service.name = "chain-test".to_string();
    conf
}

fn upper_handler(
) -> impl tower::Service<Request<String>, Response = Response<String>, Error = Status, Future: Send>
       + Clone
       + Send {
    tower::service_fn(|req: Request<String>| async move {
        Ok::<_, Status>(Response::new(req.into_message().to_uppercase()))
    })
}

#[tokio::test]
async fn chain_passes_a_normal_call_through() {
    let chain = server_chain(upper_handler(), &conf(1000), SheddingStat::new("pass"));

    let response = chain
        .oneshot(Request::new("/echo.Echo/Ping", "hello".to_string()))
        .await
        .unwrap();
    assert_eq!(response.message(), "HELLO");
}

#[tokio::test(start_paused = true)]
async fn slow_handler_hits_the_deadline_without_waiting() {
    let completions = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&completions);
    let handler = tower::service_fn(move |_req: Request<String>| {
        let counted = Arc::clone(&counted);
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            counted.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Status>(Response::new("late".to_string()))
        }
    });

    let chain = server_chain(handler, &conf(50), SheddingStat::new("slow"));
    let status = chain
        .oneshot(Request::new("/echo.Echo/Slow", "hi".to_string()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert_eq!(completions.load(Ordering::SeqCst), 0);

    // the worker is isolated, not cancelled: it still runs to completion
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(completions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panicking_handler_becomes_internal() {
    let handler = tower::service_fn(|_req: Request<String>| async move {
        panic!("handler exploded");
        #[allow(unreachable_code)]
        Ok::<_, Status>(Response::new(String::new()))
    });

    let chain = server_chain(handler, &conf(1000), SheddingStat::new("panic"));
    let status = chain
        .oneshot(Request::new("/echo.Echo/Boom", "hi".to_string()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("panic"));
}

#[tokio::test]
async fn failing_handler_opens_the_method_breaker() {
    let handler = tower::service_fn(|_req: Request<String>| async move {
        Err::<Response<String>, _>(Status::internal("backend down"))
    });

    let mut chain = server_chain(handler, &conf(1000), SheddingStat::new("open"));

    let mut saw_breaker_reject = false;
    for _ in 0..300 {
        let status = (&mut chain)
            .oneshot(Request::new("/echo.Echo/Fail", "hi".to_string()))
            .await
            .unwrap_err();
        if status.code() == Code::Unavailable {
            saw_breaker_reject = true;
            break;
        }
        assert_eq!(status.code(), Code::Internal);
    }
    assert!(saw_breaker_reject, "breaker never opened after 300 failures");
}

#[tokio::test]
async fn overloaded_shedder_rejects_with_resource_exhausted() {
    // pin the cpu above threshold and drag avg_flying over the ceiling
    let shedder = Shedder::builder().cpu_usage(|| 1000).build();
    let mut held = Vec::new();
    for _ in 0..100 {
        if let Ok(promise) = shedder.allow() {
            held.push(promise);
        }
    }
    for promise in held.drain(..60) {
        promise.pass();
    }

    let layer = SheddingLayer::new(shedder, SheddingStat::new("shed"));
    let service = layer.layer(BoxCloneService::new(upper_handler()));

    let status = service
        .oneshot(Request::new("/echo.Echo/Shed", "hi".to_string()))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::ResourceExhausted);

    for promise in held {
        promise.fail();
    }
}

#[tokio::test]
async fn metrics_count_methods_and_codes() {
    struct Find {
        metric: &'static str,
        current: Option<&'static str>,
        hits: u64,
    }

    impl metrics::Reporter for Find {
        fn start_metric(&mut self, name: &'static str, _help: &'static str) {
            self.current = Some(name);
        }

        fn report(&mut self, attrs: &metrics::Attributes, observation: metrics::Observation) {
            if self.current != Some(self.metric) {
                return;
            }
            let labelled: Vec<(String, String)> = attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            let matches = labelled
                .iter()
                .any(|(k, v)| k == "method" && v == "/echo.Echo/Counted");
            if !matches {
                return;
            }
            if let metrics::Observation::Counter(count) = observation {
                self.hits += count;
            }
        }

        fn finish_metric(&mut self) {
            self.current = None;
        }
    }

    let chain = server_chain(upper_handler(), &conf(1000), SheddingStat::new("counted"));
    chain
        .oneshot(Request::new("/echo.Echo/Counted", "hi".to_string()))
        .await
        .unwrap();

    let mut find = Find {
        metric: "rpc_server_requests_code_total",
        current: None,
        hits: 0,
    };
    metrics::global_registry().report(&mut find);
    assert!(find.hits >= 1, "expected the code counter to be recorded");
}

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pagert_runtime::{
    CompiledPage, ErrorCode, FailureKind, MemoryLogger, PageEngine, PageRequest, PageRuntime,
    Response, ScriptError, SiteSettings,
};
use tokio::io::AsyncWriteExt as _;

struct Site {
    root: tempfile::TempDir,
    uploads: tempfile::TempDir,
    log: MemoryLogger,
}

impl Site {
    fn new() -> Self {
        let root = tempfile::tempdir().expect("content root");
        let uploads = tempfile::tempdir().expect("upload dir");
        Site {
            root,
            uploads,
            log: MemoryLogger::new(),
        }
    }

    fn root(&self) -> PathBuf {
        self.root.path().canonicalize().expect("canonical root")
    }

    fn write(&self, rel: &str, data: &[u8]) -> PathBuf {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(&path, data).expect("write fixture");
        path
    }

    fn engine(&self, timeout_seconds: u64) -> PageEngine {
        let settings = SiteSettings::new("main", self.root())
            .with_upload_dir(self.uploads.path())
            .with_request_timeout_seconds(timeout_seconds);
        PageEngine::new(settings).with_logger(Arc::new(self.log.clone()))
    }

    fn page<F>(&self, f: F) -> CompiledPage
    where
        F: Fn(&mut PageRuntime) -> Result<(), ScriptError> + Send + Sync + 'static,
    {
        CompiledPage::new(self.root().join("index.page"), f)
    }

    fn leftover_uploads(&self) -> usize {
        std::fs::read_dir(self.uploads.path())
            .expect("read upload dir")
            .count()
    }
}

async fn run(site: &Site, page: &CompiledPage, request: PageRequest) -> Vec<Response> {
    let mut sent = Vec::new();
    site.engine(5).serve(page, request, &mut sent).await;
    sent
}

fn body_text(resp: &Response) -> String {
    String::from_utf8_lossy(&resp.body).into_owned()
}

#[tokio::test]
async fn page_without_operations_still_finalizes_once() {
    let site = Site::new();
    let page = site.page(|rt| {
        rt.set_header("Content-Type", "text/html");
        rt.echo("<p>hi</p>");
        Ok(())
    });
    let (resp, report) = site.engine(5).respond(&page, PageRequest::get("/")).await;
    assert_eq!(resp.status, 200);
    assert_eq!(body_text(&resp), "<p>hi</p>");
    assert_eq!(
        resp.headers.get("content-type").map(String::as_str),
        Some("text/html")
    );
    assert_eq!(report.operations, 1);
    assert!(report.failure.is_none());
}

#[tokio::test]
async fn many_operations_produce_exactly_one_response() {
    let site = Site::new();
    for i in 0..16 {
        site.write(&format!("data/{i}.txt"), format!("{i};").as_bytes());
    }
    let page = site.page(|rt| {
        for i in 0..16 {
            rt.read_file(format!("data/{i}.txt")).on_success(|rt, bytes| {
                rt.echo(bytes);
                Ok(())
            });
        }
        Ok(())
    });

    let mut sent = Vec::new();
    let report = site
        .engine(5)
        .serve(&page, PageRequest::get("/"), &mut sent)
        .await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status, 200);
    assert_eq!(report.operations, 17);
    assert_eq!(report.pending_at_finalize, 0);
    let body = body_text(&sent[0]);
    for i in 0..16 {
        assert!(body.contains(&format!("{i};")), "missing {i} in {body}");
    }
}

#[tokio::test]
async fn unhandled_failure_is_fatal_and_logged() {
    let site = Site::new();
    let page = site.page(|rt| {
        rt.echo("before");
        rt.read_file("missing.txt");
        Ok(())
    });
    let sent = run(&site, &page, PageRequest::get("/")).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status, 500);
    assert!(!body_text(&sent[0]).contains("before"));
    assert!(site.log.contains("Site: main: Runtime error on file"));
    assert!(site.log.contains("ENOENT"));
}

#[tokio::test]
async fn handled_failure_is_not_fatal() {
    let site = Site::new();
    let page = site.page(|rt| {
        rt.read_file("missing.txt").on_error(|rt, err| {
            rt.echo(format!("fallback ({})", err.code));
            Ok(())
        });
        Ok(())
    });
    let sent = run(&site, &page, PageRequest::get("/")).await;
    assert_eq!(sent[0].status, 200);
    assert_eq!(body_text(&sent[0]), "fallback (ENOENT)");
    assert!(site.log.lines().is_empty());
}

#[tokio::test]
async fn on_error_is_not_called_when_the_file_exists() {
    let site = Site::new();
    site.write("present.txt", b"here");
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    let page = site.page(move |rt| {
        let flag = flag.clone();
        rt.read_file("present.txt").on_error(move |_, _| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        Ok(())
    });
    let sent = run(&site, &page, PageRequest::get("/")).await;
    assert_eq!(sent[0].status, 200);
    assert!(!called.load(Ordering::SeqCst));
}

#[tokio::test]
async fn throwing_on_success_escalates_without_calling_on_error() {
    let site = Site::new();
    site.write("present.txt", b"here");
    let on_error_calls = Arc::new(AtomicUsize::new(0));
    let calls = on_error_calls.clone();
    let page = site.page(move |rt| {
        let calls = calls.clone();
        rt.read_file("present.txt")
            .on_success(|_, _| Err(ScriptError::new("success handler blew up")))
            .on_error(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        Ok(())
    });
    let (resp, report) = site.engine(5).respond(&page, PageRequest::get("/")).await;
    assert_eq!(resp.status, 500);
    assert_eq!(on_error_calls.load(Ordering::SeqCst), 0);
    let failure = report.failure.expect("failure recorded");
    assert_eq!(failure.kind, FailureKind::Handler);
    assert_eq!(failure.message, "success handler blew up");
}

#[tokio::test]
async fn throwing_on_error_escalates() {
    let site = Site::new();
    let page = site.page(|rt| {
        rt.read_file("missing.txt")
            .on_error(|_, err| Err(ScriptError::new(format!("rethrown: {}", err.code))));
        Ok(())
    });
    let (resp, report) = site.engine(5).respond(&page, PageRequest::get("/")).await;
    assert_eq!(resp.status, 500);
    assert_eq!(
        report.failure.map(|f| f.message).as_deref(),
        Some("rethrown: ENOENT")
    );
}

#[tokio::test]
async fn panicking_handler_is_contained() {
    let site = Site::new();
    site.write("present.txt", b"here");
    let page = site.page(|rt| {
        rt.read_file("present.txt")
            .on_success(|_, _| panic!("handler panicked"));
        rt.echo("page continued");
        Ok(())
    });
    let (resp, report) = site.engine(5).respond(&page, PageRequest::get("/")).await;
    assert_eq!(resp.status, 500);
    let failure = report.failure.expect("failure recorded");
    assert!(failure.message.contains("handler panicked"), "{failure:?}");
}

#[tokio::test]
async fn later_operation_failure_overwrites_script_exception() {
    let site = Site::new();
    let reached = Arc::new(AtomicBool::new(false));
    let after_throw = reached.clone();
    let page = site.page(move |rt| {
        rt.read_file("missing.txt");
        fail_script()?;
        after_throw.store(true, Ordering::SeqCst);
        rt.echo("unreachable");
        Ok(())
    });
    let (resp, report) = site.engine(5).respond(&page, PageRequest::get("/")).await;
    assert_eq!(resp.status, 500);
    assert!(!reached.load(Ordering::SeqCst));
    let failure = report.failure.expect("failure recorded");
    assert_eq!(failure.kind, FailureKind::Operation);
    assert!(failure.message.starts_with("ENOENT"), "{failure:?}");

    let lines = site.log.lines();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].line.contains("synchronous failure"));
    assert!(lines[1].line.contains("ENOENT"));
}

fn fail_script() -> Result<(), ScriptError> {
    Err(ScriptError::new("synchronous failure").at("index.page:2"))
}

#[tokio::test]
async fn script_exception_alone_yields_500() {
    let site = Site::new();
    let page = site.page(|rt| {
        rt.echo("partial");
        Err(ScriptError::new("boom"))
    });
    let (resp, report) = site.engine(5).respond(&page, PageRequest::get("/")).await;
    assert_eq!(resp.status, 500);
    assert!(!body_text(&resp).contains("partial"));
    assert_eq!(report.failure.map(|f| f.kind), Some(FailureKind::Script));
    assert!(site
        .log
        .contains("Site: main: Runtime error on file"));
}

#[tokio::test]
async fn handlers_may_start_more_operations() {
    let site = Site::new();
    site.write("first.txt", b"second.txt");
    site.write("second.txt", b"done");
    let page = site.page(|rt| {
        rt.read_to_string("first.txt").on_success(|rt, next| {
            rt.echo("1:");
            rt.read_to_string(next).on_success(|rt, text| {
                rt.echo(format!("2:{text}"));
                Ok(())
            });
            Ok(())
        });
        Ok(())
    });
    let (resp, report) = site.engine(5).respond(&page, PageRequest::get("/")).await;
    assert_eq!(resp.status, 200);
    assert_eq!(body_text(&resp), "1:2:done");
    assert_eq!(report.operations, 3);
}

#[tokio::test]
async fn guard_denial_surfaces_as_operation_failure() {
    let site = Site::new();
    let source = site.write("admin/index.page", b"secret");

    let page = site.page(|rt| {
        rt.delete_file("admin/index.page").on_error(|rt, err| {
            rt.echo(err.code.as_str());
            Ok(())
        });
        Ok(())
    });
    let sent = run(&site, &page, PageRequest::get("/")).await;
    assert_eq!(sent[0].status, 200);
    assert_eq!(body_text(&sent[0]), ErrorCode::NotPermitted.as_str());
    assert!(source.exists());

    let unhandled = site.page(|rt| {
        rt.copy_file("admin/index.page", "/tmp/pagert-copy.txt");
        Ok(())
    });
    let sent = run(&site, &unhandled, PageRequest::get("/")).await;
    assert_eq!(sent[0].status, 500);
    assert!(site.log.contains("EPERM"));
}

#[tokio::test]
async fn allow_flag_lifts_the_guard() {
    let site = Site::new();
    site.write("lib/util.PMOD", b"module");
    let settings = SiteSettings::new("main", site.root())
        .with_upload_dir(site.uploads.path())
        .with_allow_executable_extensions(true);
    let engine = PageEngine::new(settings).with_logger(Arc::new(site.log.clone()));
    let page = site.page(|rt| {
        rt.exists("lib/util.PMOD").on_success(|rt, found| {
            rt.echo(if found { "yes" } else { "no" });
            Ok(())
        });
        Ok(())
    });
    let (resp, _) = engine.respond(&page, PageRequest::get("/")).await;
    assert_eq!(resp.status, 200);
    assert_eq!(body_text(&resp), "yes");
}

#[tokio::test]
async fn deferred_completion_runs_under_containment() {
    let site = Site::new();
    let page = site.page(|rt| {
        let done = rt.defer();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            done.complete(|rt| {
                rt.echo("late");
                Ok(())
            });
        });
        let failing = rt.defer();
        failing.complete(|_| Err(ScriptError::new("deferred failure")));
        Ok(())
    });
    let (resp, report) = site.engine(5).respond(&page, PageRequest::get("/")).await;
    assert_eq!(resp.status, 500);
    assert_eq!(
        report.failure.map(|f| f.message).as_deref(),
        Some("deferred failure")
    );
    assert_eq!(report.pending_at_finalize, 0);
}

#[tokio::test]
async fn dropped_deferred_does_not_hang_the_request() {
    let site = Site::new();
    let page = site.page(|rt| {
        let forgotten = rt.defer();
        drop(forgotten);
        rt.echo("ok");
        Ok(())
    });
    let (resp, _) = site.engine(5).respond(&page, PageRequest::get("/")).await;
    assert_eq!(resp.status, 200);
    assert_eq!(body_text(&resp), "ok");
}

#[tokio::test]
async fn timeout_wins_over_pending_operations() {
    let site = Site::new();
    let page = site.page(|rt| {
        rt.echo("buffered");
        rt.sleep(Duration::from_secs(30)).on_success(|rt, ()| {
            rt.echo("too late");
            Ok(())
        });
        Ok(())
    });
    let mut sent = Vec::new();
    let report = site
        .engine(1)
        .serve(&page, PageRequest::get("/"), &mut sent)
        .await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status, 413);
    assert!(!body_text(&sent[0]).contains("buffered"));
    assert!(report.timed_out);
    assert_eq!(report.pending_at_finalize, 1);
    assert!(site.log.contains("Timeout exceeded limit of 1 seconds"));
}

#[tokio::test]
async fn timeout_during_upload_purges_partial_files() {
    let site = Site::new();
    let (mut client, server) = tokio::io::duplex(64 * 1024);
    client
        .write_all(
            concat!(
                "--B\r\n",
                "Content-Disposition: form-data; name=\"a\"; filename=\"a.bin\"\r\n",
                "\r\n",
                "complete part\r\n",
                "--B\r\n",
                "Content-Disposition: form-data; name=\"b\"; filename=\"b.bin\"\r\n",
                "\r\n",
                "half of the second",
            )
            .as_bytes(),
        )
        .await
        .expect("write body prefix");

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let page = site.page(move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    let request = PageRequest::post("/upload")
        .with_header("Content-Type", "multipart/form-data; boundary=B")
        .with_body(server);

    let mut sent = Vec::new();
    let report = site.engine(1).serve(&page, request, &mut sent).await;
    drop(client);

    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].status, 413);
    assert!(report.timed_out);
    // The half-received part already had its temp file.
    assert_eq!(report.uploads, 2);
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(site.leftover_uploads(), 0);
    assert!(site.log.contains("Timeout exceeded limit of 1 seconds"));
}

fn multipart_upload(field: &str, name: &str, data: &str) -> String {
    format!(
        "--B\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nreport\r\n\
         --B\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{name}\"\r\n\
         Content-Type: text/csv\r\n\r\n{data}\r\n--B--\r\n"
    )
}

#[test]
fn timeout_purge_holds_while_upload_writes_are_still_queued() {
    let site = Site::new();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(1)
        .build()
        .expect("runtime");
    // Occupy the only blocking thread so the upload's file writes queue behind it.
    let busy = rt.spawn_blocking(|| std::thread::sleep(Duration::from_millis(2500)));

    let page = site.page(|_| Ok(()));
    let request = PageRequest::post("/upload")
        .with_header("content-type", "multipart/form-data; boundary=B")
        .with_body(std::io::Cursor::new(
            multipart_upload("doc", "x.csv", "1,2,3").into_bytes(),
        ));
    let (resp, report) = rt.block_on(site.engine(1).respond(&page, request));
    assert_eq!(resp.status, 413);
    assert!(report.timed_out);
    assert_eq!(report.uploads, 1);
    assert_eq!(site.leftover_uploads(), 0);

    rt.block_on(busy).expect("blocking task");
    rt.block_on(async { tokio::time::sleep(Duration::from_millis(200)).await });
    assert_eq!(site.leftover_uploads(), 0);
}

#[tokio::test]
async fn relocated_upload_survives_finalize_and_others_are_purged() {
    let site = Site::new();
    let body = multipart_upload("doc", "q3.csv", "a,b\n1,2");
    let page = site.page(|rt| {
        let title = rt.param("title").unwrap_or("").to_string();
        let upload = rt.uploads("doc").into_iter().next();
        let Some(upload) = upload else {
            return Err(ScriptError::new("no upload"));
        };
        rt.relocate_upload(&upload, format!("files/{title}.csv"))
            .on_success(|rt, dest: PathBuf| {
                rt.echo(dest.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default());
                Ok(())
            });
        Ok(())
    });
    std::fs::create_dir_all(site.root().join("files")).expect("mkdir");
    let request = PageRequest::post("/upload")
        .with_header("content-type", "multipart/form-data; boundary=B")
        .with_body(std::io::Cursor::new(body.into_bytes()));

    let (resp, report) = site.engine(5).respond(&page, request).await;
    assert_eq!(resp.status, 200, "{:?}", report.failure);
    assert_eq!(body_text(&resp), "report.csv");
    assert_eq!(
        std::fs::read_to_string(site.root().join("files/report.csv")).expect("relocated"),
        "a,b\n1,2"
    );
    assert_eq!(site.leftover_uploads(), 0);

    let ignoring = site.page(|_| Ok(()));
    let request = PageRequest::post("/upload")
        .with_header("content-type", "multipart/form-data; boundary=B")
        .with_body(std::io::Cursor::new(
            multipart_upload("doc", "x.csv", "1").into_bytes(),
        ));
    let (resp, report) = site.engine(5).respond(&ignoring, request).await;
    assert_eq!(resp.status, 200);
    assert_eq!(report.uploads, 1);
    assert_eq!(site.leftover_uploads(), 0);
}

#[tokio::test]
async fn relocating_into_a_guarded_name_fails_and_cleans_up() {
    let site = Site::new();
    let page = site.page(|rt| {
        for upload in rt.all_uploads() {
            rt.relocate_upload(&upload, "evil.page");
        }
        Ok(())
    });
    let request = PageRequest::post("/upload")
        .with_header("content-type", "multipart/form-data; boundary=B")
        .with_body(std::io::Cursor::new(
            multipart_upload("doc", "x.csv", "1").into_bytes(),
        ));
    let (resp, _) = site.engine(5).respond(&page, request).await;
    assert_eq!(resp.status, 500);
    assert!(!site.root().join("evil.page").exists());
    assert_eq!(site.leftover_uploads(), 0);
}

#[tokio::test]
async fn malformed_body_is_rejected_before_the_page_runs() {
    let site = Site::new();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let page = site.page(move |_| {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });
    let request = PageRequest::post("/")
        .with_header("content-type", "multipart/form-data")
        .with_body(std::io::Cursor::new(b"x".to_vec()));
    let (resp, report) = site.engine(5).respond(&page, request).await;
    assert_eq!(resp.status, 400);
    assert!(report.bad_request);
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn query_and_form_params_reach_the_page() {
    let site = Site::new();
    let page = site.page(|rt| {
        let q = rt.param("q").unwrap_or("-").to_string();
        let name = rt.param("name").unwrap_or("-").to_string();
        let line = format!("{} {} {q} {name}", rt.method(), rt.url_path());
        rt.echo(line);
        rt.set_status(202);
        Ok(())
    });
    let request = PageRequest::post("/search.page?q=rust")
        .with_header("Content-Type", "application/x-www-form-urlencoded")
        .with_body(std::io::Cursor::new(b"name=Ada+L".to_vec()));
    let (resp, _) = site.engine(5).respond(&page, request).await;
    assert_eq!(resp.status, 202);
    assert_eq!(body_text(&resp), "POST /search.page rust Ada L");
}

#[tokio::test]
async fn move_falls_through_the_outcome_contract() {
    let site = Site::new();
    site.write("inbox/a.txt", b"payload");
    let page = site.page(|rt| {
        rt.move_file("inbox/a.txt", "archive.txt").on_success(|rt, ()| {
            rt.exists("inbox/a.txt").on_success(|rt, still_there| {
                rt.echo(format!("moved={}", !still_there));
                Ok(())
            });
            Ok(())
        });
        Ok(())
    });
    let (resp, _) = site.engine(5).respond(&page, PageRequest::get("/")).await;
    assert_eq!(resp.status, 200);
    assert_eq!(body_text(&resp), "moved=true");
    assert!(Path::new(&site.root().join("archive.txt")).exists());
}

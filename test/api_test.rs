/// Integration tests for the HTTP facade.
///
/// Each test binds the full application to an ephemeral local port and talks
/// to it with a real HTTP client, including multipart uploads.
///
/// ## Running Tests
///
/// ```bash
/// cargo test --test api_test
/// ```

#[cfg(all(test, unix))]
mod tests {
    use batch_supervisor::{
        api,
        launcher::ProcessLauncher,
        registry::JobRegistry,
        store::JobStore,
        supervisor::BatchSupervisor,
    };
    use pretty_assertions::assert_eq;
    use reqwest::multipart::{Form, Part};
    use reqwest::StatusCode;
    use serde_json::{json, Value};
    use batch_supervisor::job::{JobConfig, JobSnapshot};
    use chrono::Utc;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct TestServer {
        _dir: TempDir,
        jobs_dir: PathBuf,
        base: String,
        client: reqwest::Client,
    }

    impl TestServer {
        fn url(&self, path: &str) -> String {
            format!("{}/api/batch{}", self.base, path)
        }
    }

    async fn spawn_server(script: &str) -> TestServer {
        let dir = TempDir::new().unwrap();
        let script_path = dir.path().join("worker.sh");
        fs::write(&script_path, script).unwrap();

        let jobs_dir = dir.path().join("jobs");
        let supervisor = Arc::new(BatchSupervisor::with_parts(
            JobRegistry::new(),
            JobStore::new(&jobs_dir),
            ProcessLauncher::new(Some("sh".into()), script_path),
            "realtor.com".to_string(),
            Duration::from_millis(200),
        ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = api::app(supervisor, 1024 * 1024);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        TestServer {
            _dir: dir,
            jobs_dir,
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
        }
    }

    fn agents_csv(n: usize) -> Vec<u8> {
        let mut content = String::from("url\n");
        for i in 0..n {
            content.push_str(&format!(
                "https://www.realtor.com/realestateagents/agent-{}\n\n",
                i
            ));
        }
        content.into_bytes()
    }

    fn start_form(n: usize) -> Form {
        Form::new()
            .text("batchSize", "5")
            .text("tabDelay", "3")
            .text("batchDelay", "15")
            .text("tags", "buyer,hot")
            .part(
                "csvFile",
                Part::bytes(agents_csv(n))
                    .file_name("agents.csv")
                    .mime_str("text/csv")
                    .unwrap(),
            )
    }

    async fn start_job(server: &TestServer, n: usize) -> Value {
        let response = server
            .client
            .post(server.url("/start"))
            .multipart(start_form(n))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response.json().await.unwrap()
    }

    async fn get_json(server: &TestServer, path: &str) -> (StatusCode, Value) {
        let response = server.client.get(server.url(path)).send().await.unwrap();
        let status = response.status();
        (status, response.json().await.unwrap())
    }

    /// Start echoes the parsed config and the qualifying URL count.
    #[tokio::test]
    async fn test_start_scenario() {
        let server = spawn_server("sleep 1\n").await;
        let body = start_job(&server, 10).await;

        assert_eq!(body["success"], json!(true));
        assert_eq!(body["config"]["totalUrls"], json!(10));
        assert_eq!(body["config"]["tags"], json!(["buyer", "hot"]));
        assert_eq!(body["config"]["batchSize"], json!(5));
        assert!(body["jobId"].as_str().unwrap().starts_with("batch_"));

        let job_id = body["jobId"].as_str().unwrap();
        let (status, body) = get_json(&server, &format!("/status/{}", job_id)).await;
        assert_eq!(status, StatusCode::OK);
        let job_status = body["job"]["status"].as_str().unwrap();
        assert!(job_status == "starting" || job_status == "running");
    }

    /// A mangled id is a 404 with the error envelope.
    #[tokio::test]
    async fn test_status_unknown_job() {
        let server = spawn_server("sleep 1\n").await;
        let body = start_job(&server, 1).await;
        let mangled = format!("{}zz", body["jobId"].as_str().unwrap());

        let (status, body) = get_json(&server, &format!("/status/{}", mangled)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"], json!("Job not found"));
        assert!(body["message"].is_string());
    }

    /// Uploads without a file or without qualifying lines are 400s.
    #[tokio::test]
    async fn test_start_validation() {
        let server = spawn_server("exit 0\n").await;

        let response = server
            .client
            .post(server.url("/start"))
            .multipart(Form::new().text("batchSize", "5"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["success"], json!(false));

        let form = Form::new().part(
            "csvFile",
            Part::bytes(b"name\nJane\n".to_vec()).file_name("agents.csv"),
        );
        let response = server
            .client
            .post(server.url("/start"))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let (_, body) = get_json(&server, "/list").await;
        assert_eq!(body["count"], json!(0));
    }

    /// A finished job reports `completed` with an end time, and its log tail
    /// honours the `lines` boundaries.
    #[tokio::test]
    async fn test_completion_and_logs() {
        let server = spawn_server("echo hello\nexit 0\n").await;
        let body = start_job(&server, 2).await;
        let job_id = body["jobId"].as_str().unwrap().to_string();

        let mut job = Value::Null;
        for _ in 0..200 {
            let (_, body) = get_json(&server, &format!("/status/{}", job_id)).await;
            job = body["job"].clone();
            if job["status"] == json!("completed") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(job["status"], json!("completed"));
        assert!(!job["endTime"].is_null());

        let (status, body) = get_json(&server, &format!("/logs/{}?lines=0", job_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["logs"], json!([]));
        let total = body["totalLines"].as_u64().unwrap();
        assert!(total >= 2);

        let (_, body) = get_json(&server, &format!("/logs/{}?lines=100000", job_id)).await;
        assert_eq!(body["logs"].as_array().unwrap().len() as u64, total);

        let (_, body) = get_json(&server, &format!("/logs/{}", job_id)).await;
        assert_eq!(body["success"], json!(true));
    }

    /// Stop twice: both succeed, the second says the job is already stopped.
    #[tokio::test]
    async fn test_stop_twice() {
        let server = spawn_server("exec sleep 30\n").await;
        let body = start_job(&server, 1).await;
        let job_id = body["jobId"].as_str().unwrap().to_string();

        let first: Value = server
            .client
            .post(server.url(&format!("/stop/{}", job_id)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(first["success"], json!(true));
        assert_eq!(first["status"], json!("stopped"));

        let second: Value = server
            .client
            .post(server.url(&format!("/stop/{}", job_id)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(second["success"], json!(true));
        assert_eq!(second["message"], json!("Job already stopped"));

        let response = server
            .client
            .post(server.url("/stop/batch_0_nothere"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    /// Listing and a zero-day cleanup against freshly created jobs.
    #[tokio::test]
    async fn test_list_and_cleanup() {
        let server = spawn_server("exit 0\n").await;
        let a = start_job(&server, 1).await;
        let b = start_job(&server, 1).await;

        let (_, body) = get_json(&server, "/list").await;
        assert_eq!(body["count"], json!(2));
        let ids: Vec<&str> = body["jobs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|j| j["jobId"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&a["jobId"].as_str().unwrap()));
        assert!(ids.contains(&b["jobId"].as_str().unwrap()));

        let body: Value = server
            .client
            .delete(server.url("/cleanup?olderThanDays=0"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["deletedCount"], json!(0));

        let response = server
            .client
            .delete(server.url("/cleanup?olderThanDays=-1"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    /// List and cleanup walk a large jobs directory off the async workers;
    /// the server keeps answering while they run.
    #[tokio::test(flavor = "current_thread")]
    async fn test_list_and_cleanup_many_old_jobs() {
        let server = spawn_server("exit 0\n").await;
        let store = JobStore::new(&server.jobs_dir);
        for i in 0..150 {
            let job_id = format!("batch_{}_old{:06}", i, i);
            let files = store.files_for(&job_id);
            let mut snapshot = JobSnapshot::new(job_id.clone(), JobConfig::default(), 1, files);
            snapshot.start_time = Utc::now() - chrono::Duration::days(30);
            store.prepare_job(&job_id, &["https://realtor.com/a"]).unwrap();
            store.write_config(&snapshot).unwrap();
        }

        let (status, body) = get_json(&server, "/list").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], json!(150));

        let cleanup = server
            .client
            .delete(server.url("/cleanup?olderThanDays=7"))
            .send();
        let health = server.client.get(format!("{}/health", server.base)).send();
        let (cleanup, health) = tokio::join!(cleanup, health);
        assert_eq!(health.unwrap().status(), StatusCode::OK);

        let body: Value = cleanup.unwrap().json().await.unwrap();
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["deletedCount"], json!(150));

        let (_, body) = get_json(&server, "/list").await;
        assert_eq!(body["count"], json!(0));
    }

    /// The health check reports live jobs.
    #[tokio::test]
    async fn test_health() {
        let server = spawn_server("sleep 1\n").await;
        start_job(&server, 1).await;

        let body: Value = server
            .client
            .get(format!("{}/health", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["activeJobs"], json!(1));
    }
}

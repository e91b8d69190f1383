use std::time::Instant;

use super::*;

fn dummy_job(projectid: &str, scene: &str) -> RemoteJob {
  RemoteJob {
    id: "10.0.0.9:40000".to_owned(),
    projectid: projectid.to_owned(),
    filename: "00000.mkv".to_owned(),
    scene: scene.to_owned(),
    encoder: Encoder::aom,
    encoder_params: "--cpu-used=6".to_owned(),
    ffmpeg_params: String::new(),
    version: "v3.6.0".to_owned(),
    start: 0,
    frames: 30,
    grain: false,
  }
}

fn fetched(projectid: &str, scene: &str) -> FetchedJob {
  FetchedJob {
    job: dummy_job(projectid, scene),
    file: tempfile::NamedTempFile::new().unwrap().into_temp_path(),
  }
}

fn test_client(queue: usize) -> Arc<Client> {
  Client::new(
    ClientArgs {
      target: "http://127.0.0.1:1".to_owned(),
      workers: 0,
      threads: 4,
      queue,
      tools: ToolPaths::default(),
      vmaf_model_path: None,
      noui: true,
    },
    LocalVersions {
      aom: "v3.6.0".to_owned(),
      vpx: "v1.12.0".to_owned(),
    },
  )
  .unwrap()
}

#[test]
fn queue_hands_out_jobs_in_order() {
  let queue = PrefetchQueue::new(2);
  queue.push(fetched("p", "00000"));
  queue.push(fetched("p", "00001"));
  assert_eq!(queue.len(), 2);

  match queue.pop_wait(Duration::from_millis(10)) {
    Popped::Job(job) => assert_eq!(job.job.scene, "00000"),
    _ => panic!("expected a job"),
  }
  match queue.pop_wait(Duration::from_millis(10)) {
    Popped::Job(job) => assert_eq!(job.job.scene, "00001"),
    _ => panic!("expected a job"),
  }
  assert!(queue.is_empty());
}

#[test]
fn empty_queue_pop_times_out() {
  let queue = PrefetchQueue::new(1);
  let started = Instant::now();
  assert!(matches!(
    queue.pop_wait(Duration::from_millis(50)),
    Popped::Empty
  ));
  assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn producer_blocks_at_capacity_until_a_pop() {
  let queue = Arc::new(PrefetchQueue::new(1));
  queue.push(fetched("p", "00000"));

  let producer = {
    let queue = Arc::clone(&queue);
    thread::spawn(move || {
      // parks until the consumer below makes room
      assert!(queue.wait_for_space());
      queue.push(fetched("p", "00001"));
    })
  };

  thread::sleep(Duration::from_millis(50));
  assert_eq!(queue.len(), 1);
  assert!(matches!(
    queue.pop_wait(Duration::from_millis(100)),
    Popped::Job(_)
  ));
  producer.join().unwrap();
  assert_eq!(queue.len(), 1);
}

#[test]
fn close_unblocks_a_parked_consumer_within_a_second() {
  let queue = Arc::new(PrefetchQueue::new(1));

  let waiter = {
    let queue = Arc::clone(&queue);
    thread::spawn(move || {
      let started = Instant::now();
      let popped = queue.pop_wait(Duration::from_secs(30));
      (started.elapsed(), popped)
    })
  };

  thread::sleep(Duration::from_millis(50));
  queue.close();

  let (elapsed, popped) = waiter.join().unwrap();
  assert!(matches!(popped, Popped::Closed));
  assert!(elapsed < Duration::from_secs(1));
}

#[test]
fn close_unblocks_a_parked_producer_within_a_second() {
  let queue = Arc::new(PrefetchQueue::new(1));
  queue.push(fetched("p", "00000"));

  let producer = {
    let queue = Arc::clone(&queue);
    thread::spawn(move || {
      let started = Instant::now();
      let open = queue.wait_for_space();
      (started.elapsed(), open)
    })
  };

  thread::sleep(Duration::from_millis(50));
  queue.close();

  let (elapsed, open) = producer.join().unwrap();
  assert!(!open);
  assert!(elapsed < Duration::from_secs(1));
}

#[test]
fn closed_queue_drains_leftover_jobs() {
  let queue = PrefetchQueue::new(4);
  queue.push(fetched("p", "00000"));
  queue.push(fetched("p", "00001"));
  queue.close();

  assert!(matches!(
    queue.pop_wait(Duration::from_millis(10)),
    Popped::Closed
  ));
  assert_eq!(queue.drain().len(), 2);
  assert!(queue.is_empty());
}

#[test]
fn held_scenes_cover_queue_and_uploads() {
  let client = test_client(2);
  client.queue.push(fetched("p", "00003"));
  client
    .pending_uploads
    .lock()
    .push(("p".to_owned(), "00007".to_owned()));

  let held: Vec<serde_json::Value> =
    serde_json::from_str(&client.held_scenes()).unwrap();
  assert_eq!(held.len(), 2);
  assert_eq!(held[0]["projectid"], "p");
  assert_eq!(held[0]["scene"], "00003");
  assert_eq!(held[1]["scene"], "00007");
}

#[test]
fn remote_job_parses_response_headers() {
  let mut headers = reqwest::header::HeaderMap::new();
  for (name, value) in [
    ("projectid", "1617391112.91"),
    ("filename", "00002.mkv"),
    ("scene", "00004"),
    ("id", "10.0.0.9:40000"),
    ("encoder", "aom"),
    ("encoder_params", "--cpu-used=6"),
    ("ffmpeg_params", "-an"),
    ("version", "v3.6.0"),
    ("start", "120"),
    ("frames", "48"),
    ("grain", "1"),
  ] {
    headers.insert(
      reqwest::header::HeaderName::from_static(name),
      value.parse().unwrap(),
    );
  }

  let job = RemoteJob::from_headers(&headers).unwrap();
  assert_eq!(job.projectid, "1617391112.91");
  assert_eq!(job.scene, "00004");
  assert_eq!(job.encoder, Encoder::aom);
  assert_eq!(job.start, 120);
  assert_eq!(job.frames, 48);
  assert!(job.grain);

  headers.remove("frames");
  assert!(RemoteJob::from_headers(&headers).is_err());
}

#[test]
fn stop_reports_the_exit_message_once() {
  let client = test_client(0);
  client.stop(Some("bad aom version".to_owned()));
  // a second stop never overwrites the first message
  client.stop(Some("other".to_owned()));
  assert_eq!(client.wait_exit().as_deref(), Some("bad aom version"));
}

use std::path::Path;

use opendal::Operator;
use s3_log_cruncher::{Cruncher, Database, Fetcher};

const LINE: &str = r#"79a59df900b949e55d96a1e698fbacedfd6e09d98eacf8f8d5218e7cd47ef2be awsexamplebucket1 [10/Jan/2018:00:00:38 +0000] 192.0.2.3 79a59df900b949e55d96a1e698fbacedfd6e09d98eacf8f8d5218e7cd47ef2be 3E57427F3EXAMPLE REST.GET.OBJECT index.html "GET /awsexamplebucket1/index.html HTTP/1.1" 200 - 1024 1024 7 6 "-" "Mozilla/5.0 (X11; Linux x86_64)" -"#;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn bucket(rt: &tokio::runtime::Runtime, keys: &[&str]) -> Fetcher {
    let operator = Operator::new(opendal::services::Memory::default())
        .unwrap()
        .finish();
    rt.block_on(async {
        for key in keys {
            operator.write(key, format!("{LINE}\n").into_bytes()).await.unwrap();
        }
    });
    Fetcher::from_operator(operator)
}

fn cruncher(database: &Path, initdb: bool, date: Option<&str>) -> Cruncher {
    Cruncher {
        bucket: "mybucket-logs".to_string(),
        database: database.to_owned(),
        initdb,
        date: date.map(|d| d.parse().unwrap()),
        prefix: "logs/".to_string(),
        pages: None,
        region: None,
        endpoint: None,
    }
}

#[test]
fn initdb_on_empty_bucket_creates_schema() {
    let rt = runtime();
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("mydb.sql");
    let fetcher = bucket(&rt, &[]);

    let summary = cruncher(&db, true, None).crunch_with(&fetcher, &rt).unwrap();
    assert!(summary.is_complete());
    assert_eq!(summary.listed, 0);

    let db = Database::open(&db).unwrap();
    assert_eq!(db.record_count().unwrap(), 0);
    assert_eq!(db.marker_count().unwrap(), 0);
}

#[test]
fn backfill_then_daily_runs() {
    let rt = runtime();
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("mydb.sql");
    let fetcher = bucket(
        &rt,
        &[
            "logs/2018-01-09-10-00-00-AAAA",
            "logs/2018-01-09-11-00-00-BBBB",
        ],
    );

    let summary = cruncher(&db, true, None).crunch_with(&fetcher, &rt).unwrap();
    assert_eq!((summary.ingested, summary.records), (2, 2));

    let summary = cruncher(&db, false, None).crunch_with(&fetcher, &rt).unwrap();
    assert_eq!((summary.skipped, summary.ingested), (2, 0));

    let summary = cruncher(&db, false, Some("2018-01-10"))
        .crunch_with(&fetcher, &rt)
        .unwrap();
    assert_eq!(summary.listed, 0);

    assert_eq!(Database::open(&db).unwrap().record_count().unwrap(), 2);
}

#[test]
fn initdb_backs_up_existing_database() {
    let rt = runtime();
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("mydb.sql");
    let fetcher = bucket(&rt, &["logs/2018-01-09-10-00-00-AAAA"]);

    cruncher(&db, false, None).crunch_with(&fetcher, &rt).unwrap();
    let summary = cruncher(&db, true, None).crunch_with(&fetcher, &rt).unwrap();
    // The fresh database has to be backfilled again.
    assert_eq!(summary.ingested, 1);

    let backup = Database::open(&dir.path().join("mydb.sql.bak")).unwrap();
    assert_eq!(backup.marker_count().unwrap(), 1);
    assert_eq!(Database::open(&db).unwrap().record_count().unwrap(), 1);
}

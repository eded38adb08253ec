#![cfg(feature = "test-utils")]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sql_command::connection::{ColumnMeta, ResultCursor};
use sql_command::error::UNIQUE_VIOLATION;
use sql_command::prelude::*;
use sql_command::template::{DirectoryTemplateSource, PlaceholderStyle, TemplateCache};
use sql_command::test_utils::ScriptedConnection;
use tempfile::tempdir;

#[derive(Debug, Default, Clone, PartialEq)]
struct Account {
    id: i64,
    balance: i64,
}

#[derive(Debug, thiserror::Error)]
#[error("account already exists")]
struct AccountExists;

fn accounts() -> Arc<RecordMapping<Account>> {
    Arc::new(
        RecordMapping::defaulted()
            .accessor("id", |a: &Account| a.id)
            .accessor("balance", |a: &Account| a.balance)
            .mutator("id", |a: &mut Account, v: i64| a.id = v)
            .mutator("balance", |a: &mut Account, v: i64| a.balance = v),
    )
}

fn session_over(conn: ScriptedConnection) -> Session {
    Session::new(Box::new(conn), Arc::new(ConverterRegistry::with_defaults()))
}

fn insert_account() -> Insert {
    Insert::builder("insert into account values (#{id}, #{balance})")
        .record(Account { id: 1, balance: 10 }, accounts())
        .build()
        .unwrap()
}

fn duplicate_key() -> ServerError {
    ServerError {
        code: UNIQUE_VIOLATION.into(),
        message: "duplicate key value violates unique constraint \"account_pkey\"".into(),
        constraint: Some("account_pkey".into()),
        ..ServerError::default()
    }
}

#[test]
fn failed_command_rolls_back_once_and_closes_its_statement() {
    let conn = ScriptedConnection::new().fail_on("insert into account", "disk full");
    let log = conn.log();
    let mut session = session_over(conn);

    let err = session.run(&mut insert_account()).unwrap_err();
    assert!(matches!(err, SqlCommandError::Execution { .. }));
    assert_eq!(err.sql(), Some("insert into account values (?, ?)"));
    assert_eq!(log.rollbacks(), 1);
    assert_eq!(log.closed(), 1);
    assert_eq!(log.commits(), 0);

    let executed = log.snapshot().executed;
    assert_eq!(
        executed[0].1,
        vec![SqlValue::BigInt(1), SqlValue::BigInt(10)]
    );
}

#[test]
fn successful_command_is_cleaned_up_without_rollback() {
    let conn = ScriptedConnection::new();
    let log = conn.log();
    let mut session = session_over(conn);

    let insert = session.execute(insert_account()).unwrap();
    assert_eq!(insert.affected(), Some(1));
    session.commit().unwrap();
    assert_eq!(log.rollbacks(), 0);
    assert_eq!(log.closed(), 1);
    assert_eq!(log.commits(), 1);
}

#[test]
fn failed_rollback_keeps_the_original_cause() {
    let conn = ScriptedConnection::new()
        .fail_on("insert", "constraint trouble")
        .failing_rollback();
    let log = conn.log();
    let mut session = session_over(conn);

    let err = session.run(&mut insert_account()).unwrap_err();
    let SqlCommandError::FailedRollback { cause, rollback, .. } = &err else {
        panic!("expected a failed rollback, got {err:?}");
    };
    assert!(cause.to_string().contains("constraint trouble"));
    assert!(matches!(**rollback, SqlCommandError::ConnectionError(_)));
    assert_eq!(log.rollbacks(), 1);
    assert_eq!(log.closed(), 1);
}

#[test]
fn cleanup_failure_carries_the_pending_error() {
    let conn = ScriptedConnection::new()
        .fail_on("insert", "disk full")
        .failing_close();
    let mut session = session_over(conn);

    let err = session.run(&mut insert_account()).unwrap_err();
    let SqlCommandError::Cleanup { pending, .. } = &err else {
        panic!("expected a cleanup error, got {err:?}");
    };
    let pending = pending.as_ref().expect("pending error");
    assert!(matches!(**pending, SqlCommandError::Execution { .. }));
}

#[test]
fn cleanup_failure_after_success_has_nothing_pending() {
    let mut session = session_over(ScriptedConnection::new().failing_close());
    let err = session.run(&mut insert_account()).unwrap_err();
    assert!(matches!(err, SqlCommandError::Cleanup { pending: None, .. }));
}

#[test]
fn server_errors_are_tagged_and_narrowed_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let conn = ScriptedConnection::new().fail_with_server_error("insert", duplicate_key());
    let mut session =
        session_over(conn).with_exception_converter(Arc::new(move |e: &ServerError, _: &str| {
            seen.fetch_add(1, Ordering::SeqCst);
            e.is_unique_violation()
                .then(|| Box::new(AccountExists) as ApplicationError)
        }));

    let err = session.run(&mut insert_account()).unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(err.application_error::<AccountExists>().is_some());
    assert_eq!(
        err.server_error().and_then(|s| s.constraint.as_deref()),
        Some("account_pkey")
    );
}

#[test]
fn server_errors_pass_through_without_a_converter() {
    let conn = ScriptedConnection::new().fail_with_server_error("insert", duplicate_key());
    let mut session = session_over(conn);
    let err = session.run(&mut insert_account()).unwrap_err();
    assert!(matches!(err, SqlCommandError::Server { .. }));
    assert!(err.server_error().unwrap().is_unique_violation());
}

#[test]
fn notify_binds_channel_and_payload_and_reads_nothing() {
    let conn = ScriptedConnection::new().with_style(PlaceholderStyle::Postgres);
    let log = conn.log();
    let mut session = session_over(conn);

    session
        .run(&mut Notify::new("account_events", "opened 7").unwrap())
        .unwrap();
    let script = log.snapshot();
    assert_eq!(
        script.executed,
        vec![(
            "select pg_notify($1, $2)".to_string(),
            vec![
                SqlValue::Text("account_events".into()),
                SqlValue::Text("opened 7".into())
            ]
        )]
    );
    assert!(script.queried.is_empty());
    assert_eq!(log.rollbacks(), 0);
}

#[test]
fn file_templates_are_read_through_the_cache() {
    let dir = tempdir().unwrap();
    std::fs::create_dir(dir.path().join("account")).unwrap();
    std::fs::write(
        dir.path().join("account/by_id.sql"),
        "select id, balance from account where id = #{i64}",
    )
    .unwrap();

    let cursor = ResultCursor::new(
        vec![
            ColumnMeta::new("id", SqlType::BigInt),
            ColumnMeta::new("balance", SqlType::BigInt),
        ],
        vec![vec![SqlValue::BigInt(1), SqlValue::BigInt(10)]],
    );
    let conn = ScriptedConnection::new().with_result("from account", cursor);
    let log = conn.log();
    let templates = Arc::new(TemplateCache::new(Arc::new(DirectoryTemplateSource::new(
        dir.path(),
    ))));
    let mut session = session_over(conn).with_templates(Arc::clone(&templates));

    for _ in 0..2 {
        let found = session
            .execute(
                Select::builder(SqlSource::File("account/by_id.sql".into()))
                    .args(vec![SqlValue::Int(1)])
                    .guessed_mutators(accounts())
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .into_first();
        assert_eq!(found, Some(Account { id: 1, balance: 10 }));
    }
    assert_eq!(templates.len(), 1);
    assert_eq!(
        log.snapshot().prepared[0],
        "select id, balance from account where id = ?"
    );
}

#[test]
fn template_problems_leave_the_transaction_alone() {
    let conn = ScriptedConnection::new();
    let log = conn.log();
    let dir = tempdir().unwrap();
    let mut session = session_over(conn).with_templates(Arc::new(TemplateCache::new(Arc::new(
        DirectoryTemplateSource::new(dir.path()),
    ))));

    let err = session
        .run(&mut Ddl::new(SqlSource::File("nope.sql".into())).unwrap())
        .unwrap_err();
    assert!(matches!(err, SqlCommandError::TemplateNotFound(ref path) if path == "nope.sql"));

    let err = session
        .run(&mut Ddl::new("delete from account where id = #{i64").unwrap())
        .unwrap_err();
    assert!(matches!(err, SqlCommandError::TemplateError(_)));

    assert_eq!(log.rollbacks(), 0);
    assert_eq!(log.closed(), 0);
    assert!(log.snapshot().prepared.is_empty());
}

#[test]
fn call_writes_out_values_back_into_the_record() {
    let cursor = ResultCursor::new(
        vec![ColumnMeta::new("balance", SqlType::BigInt)],
        vec![vec![SqlValue::BigInt(35)]],
    );
    let conn = ScriptedConnection::new().with_result("call deposit", cursor);
    let log = conn.log();
    let mut session = session_over(conn);

    let call = session
        .execute(
            Call::builder("call deposit(#{id}, #{balance/balance})")
                .record(Account { id: 7, balance: 10 }, accounts())
                .build()
                .unwrap(),
        )
        .unwrap();
    assert_eq!(call.record(), &Account { id: 7, balance: 35 });
    assert_eq!(
        log.snapshot().executed[0].1,
        vec![SqlValue::BigInt(7), SqlValue::BigInt(10)]
    );
}

#[test]
fn bulk_copy_and_listen_need_backend_support() {
    let conn = ScriptedConnection::new();
    let log = conn.log();
    let mut session = session_over(conn);

    let err = session
        .run(
            &mut CopyIn::builder("public.account")
                .columns(["id", "balance"])
                .row(vec![SqlValue::BigInt(1), SqlValue::BigInt(10)])
                .build()
                .unwrap(),
        )
        .unwrap_err();
    assert!(err.to_string().contains("bulk copy is not supported"));

    let err = session
        .run(&mut Listen::builder("account_events").build().unwrap())
        .unwrap_err();
    assert!(err.to_string().contains("LISTEN account_events"));
    assert_eq!(log.rollbacks(), 2);
}

#[tokio::test]
async fn run_blocking_hands_the_command_back() {
    let cursor = ResultCursor::new(
        vec![ColumnMeta::new("n", SqlType::BigInt)],
        vec![vec![SqlValue::BigInt(3)]],
    );
    let conn = ScriptedConnection::new().with_result("count", cursor);
    let session = Arc::new(tokio::sync::Mutex::new(session_over(conn)));

    let select = Select::<i64>::builder("select count(*) from account")
        .scalar()
        .build()
        .unwrap();
    let select = run_blocking(Arc::clone(&session), select).await.unwrap();
    assert_eq!(select.rows(), &[3]);

    let failing = Ddl::new("drop table account").unwrap();
    let session = Arc::new(tokio::sync::Mutex::new(session_over(
        ScriptedConnection::new().fail_on("drop", "permission denied"),
    )));
    let err = run_blocking(session, failing).await.unwrap_err();
    assert!(err.to_string().contains("permission denied"));
}

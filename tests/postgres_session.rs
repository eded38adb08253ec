#![cfg(feature = "postgres")]

//! Runs against a live server when `SQL_COMMAND_PG_URL` is set, e.g.
//! `postgres://testuser@localhost/testing`; skipped otherwise.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sql_command::prelude::*;
use uuid::Uuid;

const FOO_ID: &str = "910c80af-a4fa-49fc-b6b4-62eca118fbf7";

#[derive(Debug, Clone, Default, PartialEq)]
struct Thing {
    id: Uuid,
    name: String,
}

fn mapping() -> Arc<RecordMapping<Thing>> {
    Arc::new(
        RecordMapping::defaulted()
            .accessor("id", |t: &Thing| t.id)
            .accessor("name", |t: &Thing| t.name.clone())
            .mutator("id", |t: &mut Thing, v: Uuid| t.id = v)
            .mutator("name", |t: &mut Thing, v: String| t.name = v),
    )
}

fn factory() -> Option<SessionFactory> {
    let Ok(url) = std::env::var("SQL_COMMAND_PG_URL") else {
        eprintln!("SQL_COMMAND_PG_URL not set; skipping");
        return None;
    };
    Some(
        SessionFactory::from_config(&SessionConfig::new(Target::Postgres { url }))
            .unwrap()
            .build()
            .unwrap(),
    )
}

fn open_session() -> Option<Session> {
    let mut session = factory()?.open_session().unwrap();
    session
        .run(&mut Ddl::new("create temp table thing (id uuid primary key, name text not null)").unwrap())
        .unwrap();
    session.commit().unwrap();
    Some(session)
}

// channels are per database, so every test listens on its own
fn channel() -> String {
    format!("thing_events_{}", Uuid::new_v4().simple())
}

#[test]
fn insert_commit_and_select() -> Result<(), SqlCommandError> {
    let Some(mut session) = open_session() else {
        return Ok(());
    };
    let foo = Thing {
        id: Uuid::parse_str(FOO_ID).unwrap(),
        name: "Foo".into(),
    };
    session.execute(
        Insert::builder("insert into thing (id, name) values (#{id}, #{name})")
            .record(foo.clone(), mapping())
            .build()?,
    )?;
    session.commit()?;

    let rows = session
        .execute(
            Select::builder("select id, name from thing")
                .guessed_mutators(mapping())
                .build()?,
        )?
        .into_rows();
    assert_eq!(rows, vec![foo.clone()]);

    let err = session
        .execute(
            Insert::builder("insert into thing (id, name) values (#{id}, #{name})")
                .record(foo, mapping())
                .build()?,
        )
        .unwrap_err();
    assert!(err.server_error().unwrap().is_unique_violation());
    Ok(())
}

#[test]
fn function_copy_and_notifications() -> Result<(), SqlCommandError> {
    let Some(mut session) = open_session() else {
        return Ok(());
    };

    let doubled = session.execute(
        Function::<i64>::builder("#{i64} select #{i64} * 2")
            .args(vec![SqlValue::BigInt(21)])
            .build()?,
    )?;
    assert_eq!(doubled.into_value(), Some(42));

    let copy = session.execute(
        CopyIn::builder("thing")
            .columns(["id", "name"])
            .row(vec![SqlValue::Uuid(Uuid::new_v4()), SqlValue::Text("tab\there".into())])
            .row(vec![SqlValue::Uuid(Uuid::new_v4()), SqlValue::Text("Bar".into())])
            .build()?,
    )?;
    assert_eq!(copy.copied(), Some(2));
    session.commit()?;

    let channel = channel();
    session.execute(Listen::builder(channel.as_str()).build()?)?;
    session.execute(Notify::new(channel.as_str(), "created")?)?;
    session.commit()?;

    let listen = session.execute(
        Listen::builder(channel.as_str())
            .wait(Duration::from_secs(2))
            .build()?,
    )?;
    let payloads: Vec<String> = listen
        .into_notifications()
        .into_iter()
        .map(|n| n.payload)
        .collect();
    assert_eq!(payloads, vec!["created".to_string()]);
    Ok(())
}

#[test]
fn notify_with_no_listener_succeeds() -> Result<(), SqlCommandError> {
    let Some(mut session) = open_session() else {
        return Ok(());
    };
    session.execute(Notify::new(channel(), "nobody hears this")?)?;
    session.commit()?;
    Ok(())
}

#[test]
fn listen_wait_on_an_empty_queue_runs_out() -> Result<(), SqlCommandError> {
    let Some(mut session) = open_session() else {
        return Ok(());
    };
    let started = Instant::now();
    let listen = session.execute(
        Listen::builder(channel())
            .wait(Duration::from_millis(300))
            .build()?,
    )?;
    assert!(listen.notifications().is_empty());
    assert!(started.elapsed() >= Duration::from_millis(300));
    Ok(())
}

#[test]
fn listen_in_a_transaction_still_hears_notifications() -> Result<(), SqlCommandError> {
    let Some(factory) = factory() else {
        return Ok(());
    };
    let mut session = factory.open_session()?;
    // leaves a transaction open ahead of the LISTEN
    session.execute(
        Select::<i64>::builder("select 1::int8")
            .scalar()
            .build()?,
    )?;

    let channel = channel();
    let sender = {
        let channel = channel.clone();
        std::thread::spawn(move || -> Result<(), SqlCommandError> {
            std::thread::sleep(Duration::from_millis(300));
            let mut session = factory.open_session()?;
            session.execute(Notify::new(channel, "from another session")?)?;
            session.commit()
        })
    };

    let listen = session.execute(
        Listen::builder(channel.as_str())
            .wait(Duration::from_secs(5))
            .build()?,
    )?;
    sender.join().expect("sender thread")?;

    let received = listen.into_notifications();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].channel, channel);
    assert_eq!(received[0].payload, "from another session");
    Ok(())
}

//! End-to-end table reads against the mock server.

use std::time::Duration;

use qsep_client::{ClientError, CursorState, Opcode, ReadMode, Record, Session, Value};
use qsep_test::{
    double_column, int_column, string_column, Fault, MockDatabase, MockServer, MockTable,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Products with ids in reverse storage order.
fn products(rows: usize) -> MockTable {
    let records = (0..rows)
        .rev()
        .map(|i| {
            Record::new(vec![
                Value::Integer(i as i64 + 1),
                Value::String(format!("SKU-{:04}", i + 1)),
                Value::Double(i as f64 * 0.5),
            ])
        })
        .collect();
    MockTable::new(
        "PRODUCTS",
        3,
        vec![
            int_column("ID", 4, 1),
            string_column("SKU", 10, 2),
            double_column("PRICE", 3),
        ],
    )
    .with_rows(records)
}

fn database(table: MockTable) -> MockDatabase {
    MockDatabase::new("inventory", "5.2").with_table(table)
}

fn connect(server: &MockServer, batch_size: usize) -> Session {
    let config = server
        .config()
        .read_timeout(Some(Duration::from_secs(5)))
        .batch_size(batch_size);
    Session::connect(&config).expect("connect to mock server")
}

fn ids(rows: &[Record]) -> Vec<i64> {
    rows.iter()
        .map(|r| r.get(1).and_then(Value::as_i64).unwrap())
        .collect()
}

#[test]
fn test_batch_reads_around_batch_boundary() {
    init_tracing();
    for rows in [0, 1, 2, 3, 4, 7] {
        let server = MockServer::start(database(products(rows))).unwrap();
        let mut session = connect(&server, 3);

        let mut reported = 0;
        let data = session
            .reader()
            .read_table(3, &mut |p| reported += p.rows)
            .unwrap();

        assert_eq!(data.len(), rows, "row count for {} rows", rows);
        assert_eq!(reported, rows, "progress sum for {} rows", rows);
        assert_eq!(ids(&data.rows), (1..=rows as i64).collect::<Vec<_>>());

        session.finish().unwrap();
        server.join();
    }
}

#[test]
fn test_default_batch_size_spans_two_batches() {
    init_tracing();
    let server = MockServer::start(database(products(2001))).unwrap();
    let mut session = connect(&server, 2000);

    let mut batches = Vec::new();
    let data = session
        .reader()
        .read_table(3, &mut |p| batches.push((p.rows, p.total)))
        .unwrap();

    assert_eq!(data.len(), 2001);
    assert_eq!(batches, vec![(2000, 2000), (1, 2001)]);
    assert_eq!(session.stats().batches_read, 2);
    assert_eq!(session.stats().rows_decoded, 2001);

    session.finish().unwrap();
    let fetches = server.commands_of(Opcode::TableMultiGetForward);
    assert_eq!(fetches.len(), 2);
    assert!(fetches.iter().all(|c| c.params[1] == 2000));
}

#[test]
fn test_values_decode_from_wire() {
    let server = MockServer::start(database(products(2))).unwrap();
    let mut session = connect(&server, 10);

    let data = session.reader().read_table(3, &mut |_| {}).unwrap();
    let first = &data.rows[0];
    assert_eq!(first.trimmed_str(2), Some("SKU-0001"));
    assert_eq!(first.get_by_name(&data.descriptor, "price").unwrap(), &Value::Double(0.0));
    assert_eq!(
        data.rows[1].get_by_name(&data.descriptor, "PRICE").unwrap().as_f64(),
        Some(0.5)
    );
    // SKU is space padded to its width on the wire.
    assert_eq!(first.get(2).and_then(Value::as_str), Some("SKU-0001  "));

    session.finish().unwrap();
}

#[test]
fn test_single_row_mode_matches_batch_mode() {
    let server = MockServer::start(database(products(5))).unwrap();
    let mut session = connect(&server, 2);

    let batch = session.reader().read_table(3, &mut |_| {}).unwrap();
    let mut calls = 0;
    let single = session
        .reader()
        .mode(ReadMode::SingleRow)
        .read_table(3, &mut |_| calls += 1)
        .unwrap();

    assert_eq!(batch, single);
    assert_eq!(calls, 5);
    session.finish().unwrap();

    assert_eq!(server.commands_of(Opcode::TableGet).len(), 5);
}

#[test]
fn test_mixed_case_id_column_is_sort_key() {
    let table = MockTable::new(
        "PARTS",
        9,
        vec![
            string_column("NAME", 8, 1),
            int_column("QTY", 4, 2),
            int_column("Id", 4, 3),
        ],
    )
    .with_rows(vec![
        Record::new(vec![
            Value::String("washer".into()),
            Value::Integer(1),
            Value::Integer(30),
        ]),
        Record::new(vec![
            Value::String("bolt".into()),
            Value::Integer(2),
            Value::Integer(10),
        ]),
        Record::new(vec![
            Value::String("nut".into()),
            Value::Integer(3),
            Value::Integer(20),
        ]),
    ]);
    let server = MockServer::start(MockDatabase::new("db", "1").with_table(table)).unwrap();
    let mut session = connect(&server, 10);

    let data = session.reader().read_table_by_name("parts", &mut |_| {}).unwrap();
    let names: Vec<_> = data.rows.iter().map(|r| r.trimmed_str(1).unwrap()).collect();
    assert_eq!(names, vec!["bolt", "nut", "washer"]);
    session.finish().unwrap();

    let create = &server.commands_of(Opcode::TableCreate)[0];
    // raw index, 3 fields, ordinals, transaction, one key on column 3, integer compare
    assert_eq!(create.params, vec![9, 3, 1, 2, 3, 1, 1, 3, 1]);
}

#[test]
fn test_empty_table_reports_nothing() {
    let server = MockServer::start(database(products(0))).unwrap();
    let mut session = connect(&server, 4);

    let mut calls = 0;
    let data = session.reader().read_table(3, &mut |_| calls += 1).unwrap();
    assert!(data.is_empty());
    assert_eq!(calls, 0);
    assert!(session.open_tables().is_empty());

    session.finish().unwrap();
    assert!(server.commands_of(Opcode::TableMultiGetForward).is_empty());
    assert_eq!(server.commands_of(Opcode::TableDestroy).len(), 1);
}

#[test]
fn test_unexpected_move_status_fails_cleanly() {
    let server =
        MockServer::start_with_faults(database(products(4)), vec![Fault::MoveByStatus(7)])
            .unwrap();
    let mut session = connect(&server, 3);

    let err = session.reader().read_table(3, &mut |_| {}).unwrap_err();
    assert!(matches!(
        err,
        ClientError::UnexpectedStatus {
            opcode: Opcode::TableMoveBy,
            received: 7,
            ..
        }
    ));
    assert!(err.is_protocol_error());
    // The move reply was read in full, so the scratch table is destroyed
    // and the session can still finish.
    assert!(session.open_tables().is_empty());
    assert_eq!(server.commands_of(Opcode::TableDestroy).len(), 1);
    assert!(session.finish().unwrap().accepted());
}

#[test]
fn test_bad_row_status_mid_batch() {
    let server = MockServer::start_with_faults(
        database(products(6)),
        vec![Fault::RowStatus {
            after_rows: 2,
            status: 9,
        }],
    )
    .unwrap();
    let mut session = connect(&server, 5);

    let err = session.reader().read_table(3, &mut |_| {}).unwrap_err();
    assert!(matches!(
        err,
        ClientError::UnexpectedStatus {
            opcode: Opcode::TableMultiGetForward,
            received: 9,
            ..
        }
    ));
    assert_eq!(session.state(), qsep_client::ConnectionState::Poisoned);
    assert_eq!(session.open_tables().len(), 1);

    assert!(matches!(
        session.reader().read_table(3, &mut |_| {}),
        Err(ClientError::InvalidState { .. })
    ));
    assert!(matches!(
        session.finish(),
        Err(ClientError::InvalidState { .. })
    ));
    assert!(server.commands_of(Opcode::TableDestroy).is_empty());
    assert!(server.commands_of(Opcode::TransactionAccept).is_empty());
    drop(session);
    server.join();
}

#[test]
fn test_cursor_fails_after_error() {
    let server = MockServer::start_with_faults(
        database(products(6)),
        vec![Fault::RowStatus {
            after_rows: 0,
            status: 5,
        }],
    )
    .unwrap();
    let mut session = connect(&server, 5);
    let descriptor = session.catalog().describe_table(3).unwrap();

    session.send_command(Opcode::TableCreate, &[3, 3, 1, 2, 3, 1, 1, 1, 1]).unwrap();
    session.expect_ok(Opcode::TableCreate).unwrap();
    let handle = session.read_i32().unwrap();

    let mut cursor = qsep_client::BatchCursor::new(&mut session, &descriptor, handle);
    assert!(cursor.next_batch().is_err());
    assert_eq!(cursor.state(), CursorState::Failed);
    assert!(matches!(
        cursor.next_batch(),
        Err(ClientError::InvalidState { .. })
    ));
}

#[test]
fn test_connection_drop_mid_read() {
    let server =
        MockServer::start_with_faults(database(products(10)), vec![Fault::CloseAfterRows(4)])
            .unwrap();
    let mut session = connect(&server, 3);

    let err = session.reader().read_table(3, &mut |_| {}).unwrap_err();
    assert!(matches!(err, ClientError::ConnectionClosed));
    assert!(err.is_connection_error());
    assert_eq!(session.state(), qsep_client::ConnectionState::Closed);
    assert!(session.finish().is_err());
}

#[test]
fn test_unknown_table_name() {
    let server = MockServer::start(database(products(1))).unwrap();
    let mut session = connect(&server, 3);

    let err = session
        .reader()
        .read_table_by_name("ORDERS", &mut |_| {})
        .unwrap_err();
    assert!(matches!(err, ClientError::UnknownTable(ref name) if name == "ORDERS"));
    session.finish().unwrap();
}

#[test]
fn test_scratch_table_create_rejected() {
    let server = MockServer::start_with_faults(
        database(products(3)),
        vec![Fault::TableCreateError(12)],
    )
    .unwrap();
    let mut session = connect(&server, 3);

    let err = session.reader().read_table(3, &mut |_| {}).unwrap_err();
    assert!(matches!(
        err,
        ClientError::Server {
            opcode: Opcode::TableCreate,
            code: 12
        }
    ));
    assert!(session.open_tables().is_empty());
    session.finish().unwrap();
}

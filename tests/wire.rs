use scope_daq::lecroy::error_message;
use scope_daq::transport::{read_message, FrameHeader, OP_DATA, OP_EOI};
use scope_daq::waveform::{parse_descriptor, LECROY_FIELDS};
use scope_daq::{
    CommandTable, Connection, DaqError, LeCroy, Scope, Settings, Tektronix, Vendor,
    WaveformDescriptor,
};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

fn reply_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut header = FrameHeader::outgoing(payload.len() as u32);
    header.opcode = opcode;
    let mut out = header.to_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

/// Accept one client and hand its socket to `script`.
fn serve<F>(script: F) -> (u16, JoinHandle<()>)
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (sock, _) = listener.accept().unwrap();
        script(sock);
    });
    (port, handle)
}

fn connect(port: u16) -> Connection {
    let mut conn = Connection::new("127.0.0.1", port, Duration::from_secs(2))
        .with_clear_timeout(Duration::from_millis(100));
    conn.connect().unwrap();
    conn
}

fn byte_descriptor(count: usize) -> WaveformDescriptor {
    let raw: Vec<(String, String)> = [
        ("COMM_TYPE", "byte".to_string()),
        ("COMM_ORDER", "HIFIRST".to_string()),
        ("WAVE_ARRAY_COUNT", count.to_string()),
        ("VERTICAL_GAIN", "1.0".to_string()),
        ("VERTICAL_OFFSET", "0.0".to_string()),
        ("HORIZ_INTERVAL", "1e-9".to_string()),
        ("HORIZ_OFFSET", "0.0".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    WaveformDescriptor::lecroy(parse_descriptor(LECROY_FIELDS, &raw).unwrap(), 1).unwrap()
}

#[test]
fn lecroy_rejected_command_closes_the_session() {
    let (port, server) = serve(|mut sock| {
        assert_eq!(read_message(&mut sock).unwrap(), b"CMR?\n");
        sock.write_all(&reply_frame(OP_DATA | OP_EOI, b"CMR 5\n")).unwrap();
    });

    let mut scope = LeCroy::new(connect(port), CommandTable::new(Vec::<String>::new()));
    match scope.check_errors() {
        Err(DaqError::Instrument { code, message }) => {
            assert_eq!(code, 5);
            assert_eq!(Some(message.as_str()), error_message(5));
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(matches!(scope.command("DISPLAY ON"), Err(DaqError::Io(_))));
    server.join().unwrap();
}

#[test]
fn lecroy_success_code_passes() {
    let (port, server) = serve(|mut sock| {
        read_message(&mut sock).unwrap();
        sock.write_all(&reply_frame(OP_DATA | OP_EOI, b"CMR 0\n")).unwrap();
    });

    let mut scope = LeCroy::new(connect(port), CommandTable::new(Vec::<String>::new()));
    scope.check_errors().unwrap();
    server.join().unwrap();
}

#[test]
fn lecroy_status_without_code_passes() {
    let (port, server) = serve(|mut sock| {
        read_message(&mut sock).unwrap();
        sock.write_all(&reply_frame(OP_DATA | OP_EOI, b"CMR\n")).unwrap();
    });

    let mut scope = LeCroy::new(connect(port), CommandTable::new(Vec::<String>::new()));
    scope.check_errors().unwrap();
    server.join().unwrap();
}

#[test]
fn lecroy_waveform_spans_several_frames() {
    let (port, server) = serve(|mut sock| {
        assert_eq!(read_message(&mut sock).unwrap(), b"C2:WF? DAT1\n");
        sock.write_all(&reply_frame(OP_DATA, b"C2:WF DAT1,#9000000006"))
            .unwrap();
        sock.write_all(&reply_frame(OP_DATA, &[1, 2, 3])).unwrap();
        sock.write_all(&reply_frame(OP_DATA | OP_EOI, &[0xfd, 0xfe, 0xff, b'\n']))
            .unwrap();
    });

    let mut scope = LeCroy::new(connect(port), CommandTable::new(Vec::<String>::new()));
    let desc = byte_descriptor(6);
    let block = scope.read_waveform_block(2, &desc).unwrap();
    assert_eq!(block, vec![1, 2, 3, 0xfd, 0xfe, 0xff]);
    assert_eq!(
        scope_daq::waveform::decode(&block, &desc).unwrap(),
        vec![1.0, 2.0, 3.0, -3.0, -2.0, -1.0]
    );
    server.join().unwrap();
}

fn expect_lines(reader: &mut BufReader<TcpStream>, lines: &[&str]) {
    for expected in lines {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line.trim_end(), *expected);
    }
}

#[test]
fn tektronix_curve_block_is_read_from_the_socket() {
    let (port, server) = serve(|sock| {
        let mut reader = BufReader::new(sock.try_clone().unwrap());
        let mut sock = sock;
        expect_lines(&mut reader, &["DATA:SOURCE CH3", "CURVE?"]);
        sock.write_all(b"#15\x00\x01\x02\x03\x04\n").unwrap();
        expect_lines(&mut reader, &["*ESR?"]);
        sock.write_all(b"0\n").unwrap();
    });

    let mut scope = Tektronix::new(connect(port), CommandTable::new(["*LRN"]));
    let desc = byte_descriptor(5);
    assert_eq!(
        scope.read_waveform_block(3, &desc).unwrap(),
        vec![0, 1, 2, 3, 4]
    );
    scope.check_errors().unwrap();
    server.join().unwrap();
}

#[test]
fn tektronix_block_without_newline_is_framing() {
    let (port, server) = serve(|sock| {
        let mut reader = BufReader::new(sock.try_clone().unwrap());
        let mut sock = sock;
        expect_lines(&mut reader, &["DATA:SOURCE CH1", "CURVE?"]);
        sock.write_all(b"#12\x07\x08X").unwrap();
    });

    let mut scope = Tektronix::new(connect(port), CommandTable::new(["*LRN"]));
    let err = scope.read_waveform_block(1, &byte_descriptor(2)).unwrap_err();
    assert!(matches!(err, DaqError::Framing(_)));
    server.join().unwrap();
}

#[test]
fn tektronix_status_bits_become_instrument_errors() {
    let (port, server) = serve(|sock| {
        let mut reader = BufReader::new(sock.try_clone().unwrap());
        let mut sock = sock;
        expect_lines(&mut reader, &["*ESR?"]);
        sock.write_all(b"32\n").unwrap();
    });

    let mut scope = Tektronix::new(connect(port), CommandTable::new(["*LRN"]));
    match scope.check_errors() {
        Err(DaqError::Instrument { code, message }) => {
            assert_eq!(code, 32);
            assert_eq!(message, "command error");
        }
        other => panic!("unexpected result {other:?}"),
    }
    server.join().unwrap();
}

#[test]
fn tektronix_acquisition_polls_until_idle() {
    let (port, server) = serve(|sock| {
        let mut reader = BufReader::new(sock.try_clone().unwrap());
        let mut sock = sock;
        expect_lines(&mut reader, &["ACQUIRE:STATE RUN"]);
        for state in ["1", "1", "0"] {
            expect_lines(&mut reader, &["ACQUIRE:STATE?"]);
            sock.write_all(format!("{state}\n").as_bytes()).unwrap();
        }
    });

    let mut scope = Tektronix::new(connect(port), CommandTable::new(["*LRN"]))
        .with_polling(Duration::ZERO, 10);
    scope.trigger().unwrap();
    server.join().unwrap();
}

/// Answer each expected query line with the paired reply.
fn answer(sock: TcpStream, exchange: &[(&str, Option<&str>)]) {
    let mut reader = BufReader::new(sock.try_clone().unwrap());
    let mut sock = sock;
    for (line, reply) in exchange {
        expect_lines(&mut reader, &[*line]);
        if let Some(reply) = reply {
            sock.write_all(format!("{reply}\n").as_bytes()).unwrap();
        }
    }
}

#[test]
fn tektronix_fastframe_off_is_one_event() {
    let (port, server) = serve(|sock| {
        answer(sock, &[("HORIZONTAL:FASTFRAME:STATE?", Some("0"))]);
    });

    let mut scope = Tektronix::new(connect(port), CommandTable::new(["*LRN"]));
    assert_eq!(scope.sequence_count(&Settings::new()).unwrap(), 1);
    server.join().unwrap();
}

#[test]
fn tektronix_fastframe_count_is_queried() {
    let (port, server) = serve(|sock| {
        answer(
            sock,
            &[
                ("HORIZONTAL:FASTFRAME:STATE?", Some(":HORIZONTAL:FASTFRAME:STATE 1")),
                ("HORIZONTAL:FASTFRAME:COUNT?", Some("25")),
            ],
        );
    });

    let mut scope = Tektronix::new(connect(port), CommandTable::new(["*LRN"]));
    assert_eq!(scope.sequence_count(&Settings::new()).unwrap(), 25);
    server.join().unwrap();
}

#[test]
fn tektronix_zero_fastframe_count_is_rejected() {
    let (port, server) = serve(|sock| {
        answer(
            sock,
            &[
                ("HORIZONTAL:FASTFRAME:STATE?", Some("1")),
                ("HORIZONTAL:FASTFRAME:COUNT?", Some("0")),
            ],
        );
    });

    let mut scope = Tektronix::new(connect(port), CommandTable::new(["*LRN"]));
    assert!(matches!(
        scope.sequence_count(&Settings::new()),
        Err(DaqError::Configuration(_))
    ));
    server.join().unwrap();
}

const PREAMBLE: &str = ":WFMPRE:BYT_NR 1;BIT_NR 8;ENCDG BIN;BN_FMT RP;BYT_OR LSB;NR_PT 100;\
    WFID \"Ch2, DC coupling\";PT_FMT Y;XINCR 1.0E-9;PT_OFF 10;XZERO -5.0E-9;XUNIT \"s\";\
    YMULT 4.0E-3;YZERO 0.0E+0;YOFF 128.0;YUNIT \"V\"";

#[test]
fn tektronix_descriptor_reads_preamble_with_headers_on() {
    let (port, server) = serve(|sock| {
        answer(
            sock,
            &[
                ("HEADER 1", None),
                ("DATA:SOURCE CH2", None),
                ("WFMPRE?", Some(PREAMBLE)),
                ("HEADER 0", None),
            ],
        );
    });

    let mut scope = Tektronix::new(connect(port), CommandTable::new(["*LRN"]));
    let desc = scope.descriptor(2, 4).unwrap();
    server.join().unwrap();

    assert_eq!(desc.vendor, Vendor::Tektronix);
    assert_eq!(desc.sample_count, 400);
    assert_eq!(desc.samples_per_event(), 100);
    assert_eq!(desc.block_bytes(), 400);
    assert_eq!(desc.sample_reference_offset, 10);
    assert_eq!(desc.to_physical(128.0), 0.0);
    let axis = scope_daq::waveform::build_time_axis(&desc);
    assert_eq!(axis.len(), 100);
    assert_eq!(axis[10], -5.0e-9);
}

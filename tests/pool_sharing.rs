use std::{
    io::{self, Read, Write},
    net::{Ipv4Addr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use mbport::{
    port::{
        Instance, InstanceBuilder, ListenSocketPool, ListenerOpener, SlotId,
        SocketListenerOpener, TransportMode,
    },
    server::{ModbusServer, SharedStorage},
};

/// Counts the OS-level listen sockets the pool opens.
#[derive(Clone, Default)]
struct CountingOpener(Arc<AtomicUsize>);

impl ListenerOpener for CountingOpener {
    fn open(&self, port: u16) -> io::Result<TcpListener> {
        self.0.fetch_add(1, Ordering::SeqCst);
        SocketListenerOpener {
            address: Ipv4Addr::LOCALHOST.into(),
            ..SocketListenerOpener::default()
        }
        .open(port)
    }
}

struct Shared {
    pool: Arc<ListenSocketPool>,
    opens: Arc<AtomicUsize>,
    slot: SlotId,
    port: u16,
    instances: Vec<Instance>,
}

impl Shared {
    fn new(count: usize) -> Self {
        let opener = CountingOpener::default();
        let opens = opener.0.clone();
        let pool = Arc::new(ListenSocketPool::with_opener(2, opener));

        let reservation = pool.claim(0).unwrap();
        let port = pool.status(reservation).unwrap().port.unwrap();
        let instances = (0..count)
            .map(|i| {
                let mut instance = InstanceBuilder::new(TransportMode::Tcp)
                    .with_name(format!("tcp-{i}"))
                    .with_pool(pool.clone())
                    .build();
                assert!(instance.tcp_init(port));
                assert_eq!(instance.tcp_slot(), Some(reservation));
                instance
            })
            .collect();
        pool.release(reservation).unwrap();

        Self {
            pool,
            opens,
            slot: reservation,
            port,
            instances,
        }
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn poll(&mut self, index: usize, wait: Duration) {
        self.instances[index].tcp_poll(Instant::now() + wait);
    }

    fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect_timeout(
            &(Ipv4Addr::LOCALHOST, self.port).into(),
            Duration::from_millis(500),
        )
    }
}

#[test]
fn instances_on_one_port_share_a_listen_socket() {
    let shared = Shared::new(2);
    assert_eq!(shared.opens(), 1);

    let status = shared.pool.status(shared.slot).unwrap();
    assert_eq!(status.bind_counter, 2);
    assert_eq!(status.client_counter, 0);
    assert!(status.listening);
}

#[test]
fn accept_is_refused_once_every_instance_has_a_client() {
    let mut shared = Shared::new(2);

    let first = shared.connect().unwrap();
    shared.poll(0, Duration::from_millis(100));
    assert!(shared.instances[0].tcp_is_connected());
    assert!(shared.pool.status(shared.slot).unwrap().listening);

    let _second = shared.connect().unwrap();
    shared.poll(1, Duration::from_millis(100));
    assert!(shared.instances[1].tcp_is_connected());

    let status = shared.pool.status(shared.slot).unwrap();
    assert_eq!(status.client_counter, 2);
    assert!(!status.listening);
    assert!(shared.connect().is_err());

    // The first client leaves; its instance notices on the next poll and
    // the port listens again.
    drop(first);
    shared.poll(0, Duration::from_millis(200));
    assert!(!shared.instances[0].tcp_is_connected());

    let status = shared.pool.status(shared.slot).unwrap();
    assert_eq!(status.client_counter, 1);
    assert!(status.listening);
    assert_eq!(shared.opens(), 2);
    assert!(shared.connect().is_ok());
}

#[test]
fn counters_stay_consistent_through_a_session() {
    let mut shared = Shared::new(2);

    let mut client = shared.connect().unwrap();
    shared.poll(1, Duration::from_millis(100));
    client.write_all(&[0, 1, 0, 0, 0, 6, 1, 3, 0, 0, 0, 1]).unwrap();
    shared.poll(1, Duration::from_secs(1));
    assert_eq!(shared.instances[1].tcp_get_request().len(), 12);

    for instance in &mut shared.instances {
        instance.tcp_close();
    }
    let status = shared.pool.status(shared.slot).unwrap();
    assert_eq!(status.bind_counter, 0);
    assert_eq!(status.client_counter, 0);
    assert_eq!(status.port, None);
    assert!(!status.listening);
}

#[test]
fn different_ports_use_different_slots() {
    let pool = Arc::new(ListenSocketPool::with_opener(2, CountingOpener::default()));
    let a = pool.claim(0).unwrap();
    let b = pool.claim(0).unwrap();
    assert_ne!(a, b);
    assert_ne!(pool.status(a).unwrap().port, pool.status(b).unwrap().port);

    let port_a = pool.status(a).unwrap().port.unwrap();
    let mut instance = InstanceBuilder::new(TransportMode::Tcp)
        .with_pool(pool.clone())
        .build();
    assert!(instance.tcp_init(port_a));
    assert_eq!(instance.tcp_slot(), Some(a));

    // A third port has nowhere to go.
    let mut other = InstanceBuilder::new(TransportMode::Tcp)
        .with_pool(pool.clone())
        .build();
    let free_port = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    assert!(!other.tcp_init(free_port));
}

/// Connects, retrying while every instance is still busy with an earlier
/// client and the port is therefore closed.
fn connect_when_listening(port: u16) -> TcpStream {
    let started = Instant::now();
    loop {
        match TcpStream::connect((Ipv4Addr::LOCALHOST, port)) {
            Ok(stream) => return stream,
            Err(err) if started.elapsed() < Duration::from_secs(5) => {
                eprintln!("retrying connect: {err}");
                thread::sleep(Duration::from_millis(10));
            }
            Err(err) => panic!("port {port} never listened again: {err}"),
        }
    }
}

#[test]
fn two_server_threads_share_one_port() {
    let shared = Shared::new(2);
    let Shared {
        pool,
        slot,
        port,
        instances,
        ..
    } = shared;

    let storage: SharedStorage = Arc::new(parking_lot::Mutex::new(Default::default()));
    {
        use rmodbus::server::context::ModbusContext;
        let mut storage = storage.lock();
        storage.set_holding(0, 0x0102).unwrap();
        storage.set_holding(1, 0x0304).unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let workers: Vec<_> = instances
        .into_iter()
        .map(|mut instance| {
            let stop = stop.clone();
            let mut server = ModbusServer::new(1, storage.clone());
            thread::spawn(move || server.run(&mut instance, &stop))
        })
        .collect();

    let sampler = {
        let pool = pool.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut samples = 0usize;
            while !stop.load(Ordering::SeqCst) {
                let status = pool.status(slot).unwrap();
                assert!(status.client_counter <= status.bind_counter, "{status:?}");
                samples += 1;
                thread::sleep(Duration::from_micros(200));
            }
            samples
        })
    };

    for round in 0..30u16 {
        let [hi, lo] = round.to_be_bytes();
        let mut client = connect_when_listening(port);
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.write_all(&[hi, lo, 0, 0, 0, 6, 1, 3, 0, 0, 0, 2]).unwrap();

        let mut response = [0u8; 13];
        client.read_exact(&mut response).unwrap();
        assert_eq!(response, [hi, lo, 0, 0, 0, 7, 1, 3, 4, 1, 2, 3, 4], "round {round}");

        let status = pool.status(slot).unwrap();
        assert!(status.client_counter <= status.bind_counter, "{status:?}");
    }

    stop.store(true, Ordering::SeqCst);
    for worker in workers {
        worker.join().unwrap().unwrap();
    }
    assert!(sampler.join().unwrap() > 0);

    let status = pool.status(slot).unwrap();
    assert_eq!(status.bind_counter, 0);
    assert_eq!(status.client_counter, 0);
}

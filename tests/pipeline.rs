// Copyright (c) 2017 The Enclume developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! End-to-end tests: a real listener, real sockets, full request and
//! response cycles.

use std::io::Read;
use std::io::Write;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use enclume::input::get_multipart_input;
use enclume::input::SetCookie;
use enclume::websocket;
use enclume::Config;
use enclume::HandlerResult;
use enclume::Method;
use enclume::Request;
use enclume::RequestBody;
use enclume::Response;
use enclume::Server;
use enclume::StaticRouter;

fn start_server(router: StaticRouter) -> SocketAddr {
    start_server_with(Config::default(), router)
}

fn start_server_with(config: Config, router: StaticRouter) -> SocketAddr {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = config.with_listen("127.0.0.1", 0);
    let server = Server::new(config, Arc::new(router)).unwrap();
    let addr = server.server_addr().unwrap();
    thread::spawn(move || server.run());
    addr
}

fn connect(addr: SocketAddr) -> TcpStream {
    let socket = TcpStream::connect(addr).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    socket
}

// One request, connection closed by the server afterwards.
fn roundtrip(addr: SocketAddr, request: &[u8]) -> String {
    let mut socket = connect(addr);
    socket.write_all(request).unwrap();
    let mut out = Vec::new();
    socket.read_to_end(&mut out).unwrap();
    String::from_utf8(out).unwrap()
}

fn read_head(socket: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        socket.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

fn hello(_request: &Request, response: &mut Response) -> HandlerResult {
    response.adopt(Response::text("hello world"));
    Ok(())
}

#[test]
fn basic_request_cycle() {
    let router = StaticRouter::new().route(Method::Get, "/", hello);
    let addr = start_server(router);

    let out = roundtrip(addr, b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n");
    assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{}", out);
    assert!(out.contains("Content-Length: 11\r\n"));
    assert!(out.contains("Content-Type: text/plain; charset=utf8\r\n"));
    assert!(out.ends_with("hello world"));
}

#[test]
fn keep_alive_reuses_the_connection() {
    let router = StaticRouter::new().route(Method::Get, "/", hello);
    let addr = start_server(router);

    let mut socket = connect(addr);
    socket
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let first = read_head(&mut socket);
    assert!(first.starts_with("HTTP/1.1 200 OK\r\n"), "{}", first);
    let mut body = [0u8; 11];
    socket.read_exact(&mut body).unwrap();
    assert_eq!(&body, b"hello world");

    // Same socket, second request.
    socket
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let second = read_head(&mut socket);
    assert!(second.starts_with("HTTP/1.1 200 OK\r\n"), "{}", second);
    assert!(second.contains("Connection: close\r\n"));
}

#[test]
fn missing_route_is_404() {
    let addr = start_server(StaticRouter::new());
    let out = roundtrip(addr, b"GET /nope HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", out);
}

#[test]
fn malformed_method_is_400() {
    let addr = start_server(StaticRouter::new());
    let out = roundtrip(addr, b"GOT /x HTTP/1.1\r\n\r\n");
    assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", out);
    assert!(out.contains("Connection: close\r\n"));
}

#[test]
fn unsupported_version_is_505() {
    let addr = start_server(StaticRouter::new());
    let out = roundtrip(addr, b"GET /x HTTP/7.1\r\n\r\n");
    assert!(out.starts_with("HTTP/1.1 505 "), "{}", out);
}

#[test]
fn oversized_request_line_is_414() {
    let addr = start_server(StaticRouter::new());
    let mut request = Vec::new();
    request.extend_from_slice(b"GET /");
    request.extend_from_slice(&vec![b'a'; 4096]);
    request.extend_from_slice(b" HTTP/1.1\r\n\r\n");
    let out = roundtrip(addr, &request);
    assert!(out.starts_with("HTTP/1.1 414 "), "{}", out);
}

#[test]
fn oversized_header_block_is_431() {
    let addr = start_server(StaticRouter::new());
    let mut request = Vec::new();
    request.extend_from_slice(b"GET / HTTP/1.1\r\n");
    for n in 0..200 {
        request.extend_from_slice(format!("X-Filler-{}: {}\r\n", n, "v".repeat(80)).as_bytes());
    }
    request.extend_from_slice(b"\r\n");
    let out = roundtrip(addr, &request);
    assert!(out.starts_with("HTTP/1.1 431 "), "{}", out);
}

#[test]
fn body_echo_and_pipelining() {
    fn echo(request: &Request, response: &mut Response) -> HandlerResult {
        let body = match request.data() {
            Some(RequestBody::Buffered(bytes)) => bytes.to_vec(),
            _ => Vec::new(),
        };
        response.adopt(Response::text(String::from_utf8_lossy(&body).into_owned()));
        Ok(())
    }
    let router = StaticRouter::new().route(Method::Post, "/echo", echo);
    let addr = start_server(router);

    // Two requests shipped in a single write; responses must come back
    // in order on the same connection.
    let out = roundtrip(
        addr,
        b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nfirst\
          POST /echo HTTP/1.1\r\nContent-Length: 6\r\nConnection: close\r\n\r\nsecond",
    );
    let first = out.find("\r\n\r\nfirst").expect("first echo missing");
    let second = out.find("\r\n\r\nsecond").expect("second echo missing");
    assert!(first < second, "{}", out);
}

#[test]
fn chunked_request_body_is_decoded() {
    fn len(request: &Request, response: &mut Response) -> HandlerResult {
        let body = match request.data() {
            Some(RequestBody::Buffered(bytes)) => bytes.to_vec(),
            _ => Vec::new(),
        };
        response.adopt(Response::text(format!(
            "{}:{}",
            body.len(),
            String::from_utf8_lossy(&body)
        )));
        Ok(())
    }
    let router = StaticRouter::new().route(Method::Post, "/up", len);
    let addr = start_server(router);

    let out = roundtrip(
        addr,
        b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
          4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
    );
    assert!(out.ends_with("9:Wikipedia"), "{}", out);
}

#[test]
fn large_body_spools_to_disk() {
    fn measure(request: &Request, response: &mut Response) -> HandlerResult {
        let answer = match request.data() {
            Some(RequestBody::Spooled { mut file, len }) => {
                let mut contents = Vec::new();
                file.read_to_end(&mut contents)?;
                format!("spooled {} {}", len, contents.len())
            }
            Some(RequestBody::Buffered(bytes)) => format!("buffered {}", bytes.len()),
            None => "empty".to_owned(),
        };
        response.adopt(Response::text(answer));
        Ok(())
    }

    let config = Config::default().with_spool_threshold(1024);
    let router = StaticRouter::new().route(Method::Post, "/up", measure);
    let addr = start_server_with(config, router);

    let mut request = Vec::new();
    request.extend_from_slice(b"POST /up HTTP/1.1\r\nContent-Length: 5000\r\nConnection: close\r\n\r\n");
    request.extend_from_slice(&vec![b'z'; 5000]);
    let out = roundtrip(addr, &request);
    assert!(out.ends_with("spooled 5000 5000"), "{}", out);
}

#[test]
fn streaming_handler_goes_chunked() {
    fn stream(_request: &Request, response: &mut Response) -> HandlerResult {
        response.write_all(b"part one,")?;
        response.flush()?;
        response.write_all(b"part two")?;
        Ok(())
    }
    let router = StaticRouter::new().route(Method::Get, "/stream", stream);
    let addr = start_server(router);

    let out = roundtrip(addr, b"GET /stream HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(out.contains("Transfer-Encoding: chunked\r\n"), "{}", out);
    assert!(out.contains("9\r\npart one,\r\n"));
    assert!(out.contains("8\r\npart two\r\n"));
    assert!(out.ends_with("0\r\n\r\n"));
}

#[test]
fn cookies_round_trip() {
    fn whoami(request: &Request, response: &mut Response) -> HandlerResult {
        let known = request.cookie("sid").unwrap_or("nobody").to_owned();
        response.adopt(
            Response::text(known)
                .with_cookie(SetCookie::new("sid", "42").with_path("/").http_only()),
        );
        Ok(())
    }
    let router = StaticRouter::new().route(Method::Get, "/", whoami);
    let addr = start_server(router);

    let out = roundtrip(addr, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert!(out.contains("Set-Cookie: sid=42; Path=/; HttpOnly\r\n"), "{}", out);
    assert!(out.ends_with("nobody"));

    let out = roundtrip(
        addr,
        b"GET / HTTP/1.1\r\nCookie: sid=42\r\nConnection: close\r\n\r\n",
    );
    assert!(out.ends_with("42"), "{}", out);
}

#[test]
fn multipart_form_is_parsed() {
    fn upload(request: &Request, response: &mut Response) -> HandlerResult {
        let form = get_multipart_input(request)?;
        let name = form.field("name").unwrap_or("?").to_owned();
        let file_len = form.file("data").map(|f| f.data.len()).unwrap_or(0);
        response.adopt(Response::text(format!("{} {}", name, file_len)));
        Ok(())
    }
    let router = StaticRouter::new().route(Method::Post, "/form", upload);
    let addr = start_server(router);

    let body: &[u8] = b"--XYZ\r\n\
        Content-Disposition: form-data; name=\"name\"\r\n\
        \r\n\
        Your name\r\n\
        --XYZ\r\n\
        Content-Disposition: form-data; name=\"data\"; filename=\"d.bin\"\r\n\
        Content-Type: application/octet-stream\r\n\
        \r\n\
        12345678\r\n\
        --XYZ--";
    let mut request = Vec::new();
    request.extend_from_slice(
        format!(
            "POST /form HTTP/1.1\r\n\
             Content-Type: multipart/form-data; boundary=XYZ\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n",
            body.len()
        )
        .as_bytes(),
    );
    request.extend_from_slice(body);

    let out = roundtrip(addr, &request);
    assert!(out.ends_with("Your name 8"), "{}", out);
}

#[test]
fn idle_timeout_closes_the_connection() {
    let config =
        Config::default().with_keep_alive_idle_timeout(Some(Duration::from_millis(200)));
    let addr = start_server_with(config, StaticRouter::new());

    let mut socket = connect(addr);
    // Send nothing; the server should hang up on its own.
    let mut buf = [0u8; 32];
    let n = socket.read(&mut buf).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn websocket_echo_over_tcp() {
    fn ws(request: &Request, response: &mut Response) -> HandlerResult {
        let (r, rx) = websocket::start(request, None)?;
        response.adopt(r);
        thread::spawn(move || {
            if let Ok(mut ws) = rx.recv() {
                while let Ok(Some(message)) = ws.next_message() {
                    match message {
                        websocket::Message::Text(text) => {
                            let _ = ws.send_text(&text);
                        }
                        websocket::Message::Binary(data) => {
                            let _ = ws.send_binary(&data);
                        }
                    }
                }
            }
        });
        Ok(())
    }
    let router = StaticRouter::new().route(Method::Get, "/ws", ws);
    let addr = start_server(router);

    let mut socket = connect(addr);
    socket
        .write_all(
            b"GET /ws HTTP/1.1\r\n\
              Host: x\r\n\
              Connection: Upgrade\r\n\
              Upgrade: websocket\r\n\
              Sec-WebSocket-Version: 13\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .unwrap();

    let head = read_head(&mut socket);
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{}", head);
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    // Masked "Hello" text frame from the client.
    let mask = [0x01u8, 0x02, 0x03, 0x04];
    let mut frame = vec![0x81, 0x85];
    frame.extend_from_slice(&mask);
    for (i, &b) in b"Hello".iter().enumerate() {
        frame.push(b ^ mask[i & 3]);
    }
    socket.write_all(&frame).unwrap();

    // The echo comes back unmasked: 0x81 0x05 "Hello".
    let mut echo = [0u8; 7];
    socket.read_exact(&mut echo).unwrap();
    assert_eq!(&echo[..2], &[0x81, 0x05]);
    assert_eq!(&echo[2..], b"Hello");

    // Close handshake.
    let mut close = vec![0x88, 0x82];
    close.extend_from_slice(&mask);
    let code = 1000u16.to_be_bytes();
    close.push(code[0] ^ mask[0]);
    close.push(code[1] ^ mask[1]);
    socket.write_all(&close).unwrap();

    let mut reply = [0u8; 4];
    socket.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, &[0x88, 0x02, 0x03, 0xE8]);
}

#[test]
fn head_parse_reconstruction_matches_the_wire() {
    // Rebuilding the request line and header block from the parsed
    // fields reproduces the head, modulo whitespace normalisation.
    fn rebuild(request: &Request, response: &mut Response) -> HandlerResult {
        let mut head = format!(
            "{} {} HTTP/1.1\r\n",
            request.method(),
            request.url(),
        );
        for (name, value) in request.headers() {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(&String::from_utf8_lossy(value));
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        let original = String::from_utf8_lossy(request.raw_head()).into_owned();
        response.adopt(Response::text(if head == original {
            "identical".to_owned()
        } else {
            format!("differs:\n{}\n---\n{}", head, original)
        }));
        Ok(())
    }
    let router = StaticRouter::new().route(Method::Get, "/a/b", rebuild);
    let addr = start_server(router);

    let out = roundtrip(
        addr,
        b"GET /a/b HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\nConnection: close\r\n\r\n",
    );
    assert!(out.ends_with("identical"), "{}", out);
}

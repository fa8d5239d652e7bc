//! Test support: a minimal Modbus TCP client, used by the crate tests only.
#![allow(missing_docs)]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use bma_ts::Monotonic;
use rmodbus::client::ModbusRequest;
use rmodbus::{guess_response_frame_len, ModbusProto};

use crate::Result;

/// Polls the condition until it is satisfied or the timeout expires
pub(crate) fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let start = Monotonic::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    cond()
}

pub(crate) struct TestClient {
    stream: TcpStream,
    unit: u8,
    request_id: u16,
    last_exception: Option<u8>,
}

impl TestClient {
    pub fn connect(addr: &str, unit: u8) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.set_nodelay(true).unwrap();
        Self {
            stream,
            unit,
            request_id: 0,
            last_exception: None,
        }
    }
    /// The raw Modbus exception code carried by the last response, None for a normal
    /// response
    pub fn last_exception(&self) -> Option<u8> {
        self.last_exception
    }
    fn request(&mut self) -> ModbusRequest {
        self.request_id += 1;
        let mut mreq = ModbusRequest::new(self.unit, ModbusProto::TcpUdp);
        mreq.tr_id = self.request_id;
        mreq
    }
    fn communicate(&mut self, buf: &mut Vec<u8>) -> Result<()> {
        self.stream.write_all(buf)?;
        let mut head = [0u8; 6];
        self.stream.read_exact(&mut head)?;
        buf.truncate(0);
        buf.extend(head);
        let len = guess_response_frame_len(&head, ModbusProto::TcpUdp)?;
        if len > 6 {
            let mut rest = vec![0u8; usize::from(len - 6)];
            self.stream.read_exact(&mut rest)?;
            buf.extend(rest);
        }
        // an exception response sets the high bit of the function byte, the exception
        // code follows (the MBAP header is 7 bytes)
        self.last_exception = match buf.get(7) {
            Some(func) if func & 0x80 != 0 => buf.get(8).copied(),
            _ => None,
        };
        Ok(())
    }
    pub fn read_holdings(&mut self, reg: u16, count: u16) -> Result<Vec<u16>> {
        let mut mreq = self.request();
        let mut buf = Vec::with_capacity(256);
        mreq.generate_get_holdings(reg, count, &mut buf)?;
        self.communicate(&mut buf)?;
        let data = mreq.parse_slice(&buf)?;
        Ok(data
            .chunks(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }
    pub fn read_inputs(&mut self, reg: u16, count: u16) -> Result<Vec<u16>> {
        let mut mreq = self.request();
        let mut buf = Vec::with_capacity(256);
        mreq.generate_get_inputs(reg, count, &mut buf)?;
        self.communicate(&mut buf)?;
        let data = mreq.parse_slice(&buf)?;
        Ok(data
            .chunks(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }
    pub fn read_coils(&mut self, reg: u16, count: u16) -> Result<Vec<u8>> {
        let mut mreq = self.request();
        let mut buf = Vec::with_capacity(256);
        mreq.generate_get_coils(reg, count, &mut buf)?;
        self.communicate(&mut buf)?;
        let mut data = Vec::new();
        mreq.parse_bool_u8(&buf, &mut data)?;
        // the response is bit-packed, the tail of the last byte is padding
        data.truncate(usize::from(count));
        Ok(data)
    }
    pub fn read_discretes(&mut self, reg: u16, count: u16) -> Result<Vec<u8>> {
        let mut mreq = self.request();
        let mut buf = Vec::with_capacity(256);
        mreq.generate_get_discretes(reg, count, &mut buf)?;
        self.communicate(&mut buf)?;
        let mut data = Vec::new();
        mreq.parse_bool_u8(&buf, &mut data)?;
        data.truncate(usize::from(count));
        Ok(data)
    }
    pub fn write_holding(&mut self, reg: u16, value: u16) -> Result<()> {
        let mut mreq = self.request();
        let mut buf = Vec::with_capacity(256);
        mreq.generate_set_holding(reg, value, &mut buf)?;
        self.communicate(&mut buf)?;
        mreq.parse_ok(&buf)?;
        Ok(())
    }
    pub fn write_holdings(&mut self, reg: u16, values: &[u16]) -> Result<()> {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        let mut mreq = self.request();
        let mut buf = Vec::with_capacity(256);
        mreq.generate_set_holdings_bulk_from_slice(reg, &data, &mut buf)?;
        self.communicate(&mut buf)?;
        mreq.parse_ok(&buf)?;
        Ok(())
    }
    pub fn write_coil(&mut self, reg: u16, value: bool) -> Result<()> {
        let mut mreq = self.request();
        let mut buf = Vec::with_capacity(256);
        mreq.generate_set_coil(reg, u8::from(value), &mut buf)?;
        self.communicate(&mut buf)?;
        mreq.parse_ok(&buf)?;
        Ok(())
    }
}

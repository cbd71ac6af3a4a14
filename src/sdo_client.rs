use std::io;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};

use crate::cmd_header::{
    SdoInitiateCmd, SdoSegmentCmd, COMMAND_MASK, EXPEDITED, NO_MORE_DATA, REQUEST_ABORTED,
    REQUEST_DOWNLOAD, REQUEST_SEGMENT_DOWNLOAD, REQUEST_SEGMENT_UPLOAD, REQUEST_UPLOAD,
    RESPONSE_ABORTED, RESPONSE_DOWNLOAD, RESPONSE_SEGMENT_DOWNLOAD, RESPONSE_SEGMENT_UPLOAD,
    RESPONSE_UPLOAD, SIZE_SPECIFIED, TOGGLE_BIT,
};
use crate::config::SdoConfig;
use crate::constant::{COB_FUNC_RECEIVE_SDO, COB_FUNC_TRANSMIT_SDO};
use crate::error::{AbortCode, Error, Result};
use crate::network::{Network, SubscriptionId};
use crate::object_dictionary::{DictionaryAccess, ObjectDictionary};
use crate::sdo_server::sdo_frame;
use crate::util::flatten;
use crate::{debug, error, info, warn};

/// SDO client channel towards one remote server.
///
/// Only one transfer runs at a time; concurrent callers wait on an internal
/// lock until the running transfer completes.
pub struct SdoClient {
    /// Requests are sent here (0x600 + node id).
    tx_cobid: u32,
    /// Responses arrive here (0x580 + node id).
    rx_cobid: u32,
    network: Arc<Network>,
    od: Arc<ObjectDictionary>,
    config: SdoConfig,
    responses: Receiver<[u8; 8]>,
    transaction: Mutex<()>,
    subscription: SubscriptionId,
}

impl SdoClient {
    pub fn new(node_id: u8, od: Arc<ObjectDictionary>, network: Arc<Network>) -> Self {
        Self::with_config(node_id, od, network, SdoConfig::default())
    }

    pub fn with_config(node_id: u8, od: Arc<ObjectDictionary>, network: Arc<Network>, config: SdoConfig) -> Self {
        Self::with_cob_ids(
            COB_FUNC_RECEIVE_SDO + node_id as u32,
            COB_FUNC_TRANSMIT_SDO + node_id as u32,
            od,
            network,
            config,
        )
    }

    /// Client on a non-default SDO channel pair.
    pub fn with_cob_ids(
        tx_cobid: u32,
        rx_cobid: u32,
        od: Arc<ObjectDictionary>,
        network: Arc<Network>,
        config: SdoConfig,
    ) -> Self {
        let (tx, responses) = channel::unbounded();
        let subscription = network.subscribe(rx_cobid, move |_, data, _| {
            let _ = tx.send(flatten(&[data]));
        });
        SdoClient { tx_cobid, rx_cobid, network, od, config, responses, transaction: Mutex::new(()), subscription }
    }

    pub fn config(&self) -> &SdoConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded value is (), a poisoned lock carries no broken state.
        self.transaction.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send_request(&self, request: &[u8; 8]) -> Result<()> {
        if !self.config.pause_before_send.is_zero() {
            thread::sleep(self.config.pause_before_send);
        }
        let mut retries_left = self.config.max_retries;
        loop {
            match self.network.send_message(self.tx_cobid, request) {
                Ok(()) => return Ok(()),
                Err(e) if retries_left > 0 => {
                    retries_left -= 1;
                    info!("Sending SDO request failed, retrying: {}", e);
                    thread::sleep(self.config.retry_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn read_response(&self) -> Result<[u8; 8]> {
        let response = match self.responses.recv_timeout(self.config.response_timeout) {
            Ok(response) => response,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::CommunicationTimeout);
            }
        };
        if response[0] == RESPONSE_ABORTED {
            let code = u32::from_le_bytes([response[4], response[5], response[6], response[7]]);
            return Err(Error::Aborted { code });
        }
        Ok(response)
    }

    /// Send a request and wait for its response, resending on timeout.
    fn request_response(&self, index: u16, sub_index: u8, request: &[u8; 8]) -> Result<[u8; 8]> {
        // Late responses of an earlier transfer must not be taken for ours.
        while self.responses.try_recv().is_ok() {}
        let mut retries_left = self.config.max_retries;
        loop {
            self.send_request(request)?;
            match self.read_response() {
                Err(Error::CommunicationTimeout) if retries_left > 0 => {
                    retries_left -= 1;
                    warn!("No SDO response received for {:#06x}:{:02x}, retrying", index, sub_index);
                }
                Err(Error::CommunicationTimeout) => {
                    self.send_abort(index, sub_index, AbortCode::SdoProtocolTimedOut.code());
                    return Err(Error::CommunicationTimeout);
                }
                other => return other,
            }
        }
    }

    fn send_abort(&self, index: u16, sub_index: u8, code: u32) {
        let frame = sdo_frame(REQUEST_ABORTED, index, sub_index, &code.to_le_bytes());
        if let Err(e) = self.network.send_message(self.tx_cobid, &frame) {
            error!("Failed to send SDO abort: {}", e);
        }
    }

    /// Abort the transfer of the given entry.
    pub fn abort(&self, index: u16, sub_index: u8, code: u32) {
        info!("Aborting SDO transfer of {:#06x}:{:02x} with {:#010x}", index, sub_index, code);
        self.send_abort(index, sub_index, code);
    }

    /// Read the raw bytes of an entry.
    ///
    /// Fixed-size entries known to the dictionary are cut to their width when
    /// the server sends more.
    pub fn upload(&self, index: u16, sub_index: u8) -> Result<Vec<u8>> {
        let stream = self.open_reader(index, sub_index)?;
        let response_size = stream.size();
        let mut data = stream.read_all()?;
        if let Some(size) = self.od.variable(index, sub_index).ok().and_then(|v| v.data_type().size()) {
            if response_size.map_or(true, |r| size < r) && data.len() > size {
                data.truncate(size);
            }
        }
        Ok(data)
    }

    /// Write raw bytes to an entry, expedited when they fit unless
    /// `force_segment` is set.
    pub fn download(&self, index: u16, sub_index: u8, data: &[u8], force_segment: bool) -> Result<()> {
        let mut stream = self.open_writer(index, sub_index, Some(data.len()), force_segment)?;
        stream.write_data(data)?;
        stream.finish()
    }

    /// Start an upload and return it as a byte stream.
    pub fn open_reader(&self, index: u16, sub_index: u8) -> Result<UploadStream<'_>> {
        let guard = self.lock();
        debug!("Reading {:#06x}:{:02x} from node {:#x}", index, sub_index, self.tx_cobid);
        let response = self.request_response(index, sub_index, &sdo_frame(REQUEST_UPLOAD, index, sub_index, &[]))?;
        check_initiate_response(&response, RESPONSE_UPLOAD, index, sub_index)?;

        let mut stream = UploadStream {
            client: self,
            _guard: guard,
            index,
            sub_index,
            size: None,
            toggle: 0,
            done: false,
            pending: Vec::new(),
        };
        let cmd = SdoInitiateCmd::from(response[0]);
        if response[0] & EXPEDITED != 0 {
            let len = cmd.expedited_len();
            stream.pending = response[4..4 + len].to_vec();
            stream.size = Some(len);
            stream.done = true;
        } else if response[0] & SIZE_SPECIFIED != 0 {
            let size = u32::from_le_bytes([response[4], response[5], response[6], response[7]]);
            stream.size = Some(size as usize);
            debug!("Using segmented transfer of {} bytes", size);
        } else {
            debug!("Using segmented transfer of unknown size");
        }
        Ok(stream)
    }

    /// Start a download; data is written to the returned stream.
    ///
    /// `size`, when known, is announced to the server. Expedited transfer is
    /// used for sizes of 1 to 4 bytes unless `force_segment` is set.
    pub fn open_writer(
        &self,
        index: u16,
        sub_index: u8,
        size: Option<usize>,
        force_segment: bool,
    ) -> Result<DownloadStream<'_>> {
        let guard = self.lock();
        let expedited = !force_segment && matches!(size, Some(1..=4));
        if !expedited {
            let mut cmd = REQUEST_DOWNLOAD;
            let mut payload = [0u8; 4];
            if let Some(size) = size {
                cmd |= SIZE_SPECIFIED;
                payload = (size as u32).to_le_bytes();
            }
            let request = sdo_frame(cmd, index, sub_index, &payload);
            let response = self.request_response(index, sub_index, &request)?;
            check_initiate_response(&response, RESPONSE_DOWNLOAD, index, sub_index)?;
        }
        Ok(DownloadStream {
            client: self,
            _guard: guard,
            index,
            sub_index,
            expedited,
            pending: Vec::new(),
            toggle: 0,
            finished: false,
        })
    }
}

fn check_initiate_response(response: &[u8; 8], expected: u8, index: u16, sub_index: u8) -> Result<()> {
    if response[0] & COMMAND_MASK != expected {
        return Err(Error::UnexpectedResponse(format!("command {:#04x}", response[0])));
    }
    let (res_index, res_sub) = (u16::from_le_bytes([response[1], response[2]]), response[3]);
    if res_index != index || res_sub != sub_index {
        return Err(Error::UnexpectedResponse(format!(
            "node returned {:#06x}:{:02x} instead of {:#06x}:{:02x}",
            res_index, res_sub, index, sub_index
        )));
    }
    Ok(())
}

impl Drop for SdoClient {
    fn drop(&mut self) {
        self.network.unsubscribe(self.rx_cobid, self.subscription);
    }
}

impl DictionaryAccess for SdoClient {
    fn dictionary(&self) -> &ObjectDictionary {
        &self.od
    }

    fn read_raw(&self, index: u16, sub_index: u8) -> Result<Vec<u8>> {
        self.upload(index, sub_index)
    }

    fn write_raw(&self, index: u16, sub_index: u8, data: &[u8]) -> Result<()> {
        self.download(index, sub_index, data, false)
    }
}

fn to_io_error(e: Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

/// Segmented upload in progress, readable with [`io::Read`].
pub struct UploadStream<'a> {
    client: &'a SdoClient,
    _guard: MutexGuard<'a, ()>,
    index: u16,
    sub_index: u8,
    size: Option<usize>,
    toggle: u8,
    done: bool,
    pending: Vec<u8>,
}

impl UploadStream<'_> {
    /// Total size announced by the server.
    pub fn size(&self) -> Option<usize> {
        self.size
    }

    /// Request the next segment; `None` once the last one was received.
    fn read_segment(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        let client = self.client;
        let request = flatten(&[&[REQUEST_SEGMENT_UPLOAD | self.toggle]]);
        let response = client.request_response(self.index, self.sub_index, &request)?;
        if response[0] & COMMAND_MASK != RESPONSE_SEGMENT_UPLOAD {
            return Err(Error::UnexpectedResponse(format!("command {:#04x}", response[0])));
        }
        if response[0] & TOGGLE_BIT != self.toggle {
            client.send_abort(self.index, self.sub_index, AbortCode::ToggleBitNotAlternated.code());
            return Err(Error::ToggleBitError);
        }
        let cmd = SdoSegmentCmd::from(response[0]);
        if response[0] & NO_MORE_DATA != 0 {
            self.done = true;
        }
        self.toggle ^= TOGGLE_BIT;
        Ok(Some(response[1..1 + cmd.data_len()].to_vec()))
    }

    /// Read the remaining data.
    pub fn read_all(mut self) -> Result<Vec<u8>> {
        let mut data = mem::take(&mut self.pending);
        while let Some(segment) = self.read_segment()? {
            data.extend_from_slice(&segment);
        }
        Ok(data)
    }
}

impl io::Read for UploadStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            match self.read_segment().map_err(to_io_error)? {
                Some(segment) => self.pending = segment,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Download in progress, writable with [`io::Write`].
///
/// Call [`finish`](DownloadStream::finish) to send the final segment and get
/// its result; dropping the stream finishes it and only logs failures.
pub struct DownloadStream<'a> {
    client: &'a SdoClient,
    _guard: MutexGuard<'a, ()>,
    index: u16,
    sub_index: u8,
    expedited: bool,
    pending: Vec<u8>,
    toggle: u8,
    finished: bool,
}

impl DownloadStream<'_> {
    fn send_segment(&mut self, data: &[u8], last: bool) -> Result<()> {
        let client = self.client;
        let mut cmd = REQUEST_SEGMENT_DOWNLOAD | self.toggle | (((7 - data.len()) as u8) << 1);
        if last {
            cmd |= NO_MORE_DATA;
        }
        let response = client.request_response(self.index, self.sub_index, &flatten(&[&[cmd], data]))?;
        if response[0] & COMMAND_MASK != RESPONSE_SEGMENT_DOWNLOAD {
            return Err(Error::UnexpectedResponse(format!("command {:#04x}", response[0])));
        }
        if response[0] & TOGGLE_BIT != self.toggle {
            client.send_abort(self.index, self.sub_index, AbortCode::ToggleBitNotAlternated.code());
            return Err(Error::ToggleBitError);
        }
        self.toggle ^= TOGGLE_BIT;
        Ok(())
    }

    /// Queue data, sending full segments while more than 7 bytes are pending.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidValue("download already finished".to_string()));
        }
        self.pending.extend_from_slice(data);
        if self.expedited {
            return Ok(());
        }
        while self.pending.len() > 7 {
            let segment: Vec<u8> = self.pending.drain(..7).collect();
            if let Err(e) = self.send_segment(&segment, false) {
                self.finished = true;
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.finish_inner()
    }

    fn finish_inner(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let data = mem::take(&mut self.pending);
        if !self.expedited {
            return self.send_segment(&data, true);
        }
        if data.is_empty() || data.len() > 4 {
            return Err(Error::InvalidValue(format!("{} bytes do not fit an expedited transfer", data.len())));
        }
        let cmd = REQUEST_DOWNLOAD | EXPEDITED | SIZE_SPECIFIED | (((4 - data.len()) as u8) << 2);
        let request = sdo_frame(cmd, self.index, self.sub_index, &data);
        let response = self.client.request_response(self.index, self.sub_index, &request)?;
        check_initiate_response(&response, RESPONSE_DOWNLOAD, self.index, self.sub_index)
    }
}

impl io::Write for DownloadStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_data(buf).map_err(to_io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for DownloadStream<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish_inner() {
            error!("Download of {:#06x}:{:02x} failed: {}", self.index, self.sub_index, e);
        }
    }
}

// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The seam between the server core and whatever produces responses.

use crate::errors::Result;
use crate::request::Request;

/// Turns a parsed request into a response.
///
/// The core hands a [`Request`] in the `Ready` state to [`respond`]; the
/// implementation reads the body through the request's body methods and
/// writes the response through [`Request::set_status`],
/// [`Request::add_header`], [`Request::send_headers`] and
/// [`Request::write`]. Returning an error before headers are sent turns into
/// a `500`; after headers are sent the connection is closed.
///
/// [`respond`]: Gateway::respond
pub trait Gateway: Send + Sync {
    /// Produce the response for one request.
    fn respond(&self, req: &mut Request<'_>) -> Result<()>;
}
